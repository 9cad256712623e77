//! # Analytics Aggregator
//!
//! Rolls visits up into day/week/month statistics and compares periods.
//!
//! Durations are clipped to the period, so a visit spanning midnight counts
//! its overlap towards each day and its full duration exactly once overall.
//! A still-open visit contributes `now - entry_time` live. Period
//! boundaries are resolved at a fixed UTC offset with weeks starting on
//! Monday.

use std::collections::BTreeMap;

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{PlaceTrackerError, Result};
use crate::store::{lock_store, PlaceStore, SharedStore};
use crate::visits::CurrentStateReader;
use crate::{local_datetime, Category, CurrentState, Place, PlaceId, TimeRange, Timestamp, Visit, VisitId};

/// Relative change within this band counts as stable.
pub const STABLE_BAND_PERCENT: f64 = 10.0;

/// Number of places listed in [`PeriodStats::top_places`].
pub const DEFAULT_TOP_PLACES: usize = 5;

// ============================================================================
// Periods
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Day,
    Week,
    Month,
    Custom,
}

/// A resolved statistics period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPeriod {
    pub kind: PeriodKind,
    pub range: TimeRange,
}

impl StatsPeriod {
    /// The local day containing `ts`.
    pub fn day_containing(ts: Timestamp, utc_offset_secs: i32) -> Result<Self> {
        let date = local_date(ts, utc_offset_secs)?;
        let next = date.checked_add_days(Days::new(1)).ok_or_else(|| out_of_range(ts))?;
        Ok(Self {
            kind: PeriodKind::Day,
            range: TimeRange::new(
                day_start(date, utc_offset_secs)?,
                day_start(next, utc_offset_secs)?,
            ),
        })
    }

    /// The local Monday-to-Sunday week containing `ts`.
    pub fn week_containing(ts: Timestamp, utc_offset_secs: i32) -> Result<Self> {
        let date = local_date(ts, utc_offset_secs)?;
        let back = u64::from(date.weekday().num_days_from_monday());
        let monday = date.checked_sub_days(Days::new(back)).ok_or_else(|| out_of_range(ts))?;
        let next = monday.checked_add_days(Days::new(7)).ok_or_else(|| out_of_range(ts))?;
        Ok(Self {
            kind: PeriodKind::Week,
            range: TimeRange::new(
                day_start(monday, utc_offset_secs)?,
                day_start(next, utc_offset_secs)?,
            ),
        })
    }

    /// The local calendar month containing `ts`.
    pub fn month_containing(ts: Timestamp, utc_offset_secs: i32) -> Result<Self> {
        let date = local_date(ts, utc_offset_secs)?;
        let first = date.with_day(1).ok_or_else(|| out_of_range(ts))?;
        let next = first.checked_add_months(Months::new(1)).ok_or_else(|| out_of_range(ts))?;
        Ok(Self {
            kind: PeriodKind::Month,
            range: TimeRange::new(
                day_start(first, utc_offset_secs)?,
                day_start(next, utc_offset_secs)?,
            ),
        })
    }

    pub fn custom(range: TimeRange) -> Self {
        Self {
            kind: PeriodKind::Custom,
            range,
        }
    }

    /// The period of the same kind immediately before this one.
    pub fn previous(&self, utc_offset_secs: i32) -> Result<Self> {
        let last_second = self.range.start - 1;
        match self.kind {
            PeriodKind::Day => Self::day_containing(last_second, utc_offset_secs),
            PeriodKind::Week => Self::week_containing(last_second, utc_offset_secs),
            PeriodKind::Month => Self::month_containing(last_second, utc_offset_secs),
            PeriodKind::Custom => Ok(Self::custom(TimeRange::new(
                self.range.start - self.range.duration_secs(),
                self.range.start,
            ))),
        }
    }
}

fn out_of_range(ts: Timestamp) -> PlaceTrackerError {
    PlaceTrackerError::Internal {
        message: format!("timestamp {} out of calendar range", ts),
    }
}

fn local_date(ts: Timestamp, utc_offset_secs: i32) -> Result<NaiveDate> {
    local_datetime(ts, utc_offset_secs)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| out_of_range(ts))
}

/// Unix time of local midnight on `date`.
fn day_start(date: NaiveDate, utc_offset_secs: i32) -> Result<Timestamp> {
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| PlaceTrackerError::Internal {
        message: format!("no midnight for {}", date),
    })?;
    Ok(midnight.and_utc().timestamp() - i64::from(utc_offset_secs))
}

// ============================================================================
// Period statistics
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub visits: u32,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceStats {
    pub place_id: PlaceId,
    pub category: Category,
    pub visits: u32,
    pub duration_secs: i64,
}

/// Rollup of the visits overlapping one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodStats {
    pub period: StatsPeriod,
    pub total_visits: u32,
    pub total_duration_secs: i64,
    pub by_category: BTreeMap<Category, CategoryStats>,
    pub by_place: BTreeMap<PlaceId, PlaceStats>,
    /// Places ordered by time spent, longest first
    pub top_places: Vec<PlaceStats>,
    /// Force-closed visits included in the totals
    pub reconciled_visits: u32,
    pub reconciled_duration_secs: i64,
    /// The open visit contributing live time, if it overlaps the period
    pub active_visit_id: Option<VisitId>,
    pub active_duration_secs: i64,
}

impl PeriodStats {
    pub fn category_duration(&self, category: Category) -> i64 {
        self.by_category.get(&category).map_or(0, |c| c.duration_secs)
    }
}

/// Aggregate `visits` over `period`.
///
/// A visit is counted when it overlaps the period, or when it is open and
/// started inside it. Open visits end at `now`.
pub fn aggregate(
    period: &StatsPeriod,
    visits: &[Visit],
    places: &[Place],
    current: &CurrentState,
    now: Timestamp,
    top_n: usize,
) -> PeriodStats {
    let categories: BTreeMap<PlaceId, Category> = places.iter().map(|p| (p.id, p.category)).collect();
    let range = period.range;

    let mut stats = PeriodStats {
        period: *period,
        total_visits: 0,
        total_duration_secs: 0,
        by_category: BTreeMap::new(),
        by_place: BTreeMap::new(),
        top_places: Vec::new(),
        reconciled_visits: 0,
        reconciled_duration_secs: 0,
        active_visit_id: None,
        active_duration_secs: 0,
    };

    for visit in visits {
        let end = visit.effective_end(now);
        let overlap = range.overlap_secs(visit.entry_time, end);
        let counted = overlap > 0 || (visit.is_open() && range.contains(visit.entry_time));
        if !counted {
            continue;
        }

        let category = categories.get(&visit.place_id).copied().unwrap_or(Category::Other);
        stats.total_visits += 1;
        stats.total_duration_secs += overlap;

        let cat = stats.by_category.entry(category).or_default();
        cat.visits += 1;
        cat.duration_secs += overlap;

        let place = stats.by_place.entry(visit.place_id).or_insert_with(|| PlaceStats {
            place_id: visit.place_id,
            category,
            visits: 0,
            duration_secs: 0,
        });
        place.visits += 1;
        place.duration_secs += overlap;

        if visit.reconciled {
            stats.reconciled_visits += 1;
            stats.reconciled_duration_secs += overlap;
        }
        if visit.is_open() && (current.current_visit_id == Some(visit.id) || stats.active_visit_id.is_none()) {
            stats.active_visit_id = Some(visit.id);
            stats.active_duration_secs = overlap;
        }
    }

    let mut top: Vec<PlaceStats> = stats.by_place.values().cloned().collect();
    top.sort_by(|a, b| b.duration_secs.cmp(&a.duration_secs).then(a.place_id.cmp(&b.place_id)));
    top.truncate(top_n);
    stats.top_places = top;

    stats
}

// ============================================================================
// Period comparison
// ============================================================================

/// Relative change between two periods.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Percent(f64),
    /// Previous period had nothing, the current one has something
    NewActivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Up,
    Down,
    Stable,
    New,
}

/// Percentage change with the zero-base convention: `0 -> 0` is 0%,
/// `0 -> n` is new activity.
pub fn percent_change(previous: i64, current: i64) -> Change {
    if previous == 0 {
        if current == 0 {
            Change::Percent(0.0)
        } else {
            Change::NewActivity
        }
    } else {
        Change::Percent((current - previous) as f64 / previous as f64 * 100.0)
    }
}

pub fn trend_of(change: Change) -> Trend {
    match change {
        Change::NewActivity => Trend::New,
        Change::Percent(p) if p > STABLE_BAND_PERCENT => Trend::Up,
        Change::Percent(p) if p < -STABLE_BAND_PERCENT => Trend::Down,
        Change::Percent(_) => Trend::Stable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricChange {
    pub previous_secs: i64,
    pub current_secs: i64,
    pub change: Change,
    pub trend: Trend,
}

impl MetricChange {
    pub fn between(previous_secs: i64, current_secs: i64) -> Self {
        let change = percent_change(previous_secs, current_secs);
        Self {
            previous_secs,
            current_secs,
            change,
            trend: trend_of(change),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodComparison {
    pub previous: StatsPeriod,
    pub current: StatsPeriod,
    pub total: MetricChange,
    /// Every category present in either period
    pub by_category: BTreeMap<Category, MetricChange>,
}

/// Compare time spent between two periods, in total and per category.
pub fn compare(previous: &PeriodStats, current: &PeriodStats) -> PeriodComparison {
    let by_category = previous
        .by_category
        .keys()
        .chain(current.by_category.keys())
        .map(|&category| {
            (
                category,
                MetricChange::between(
                    previous.category_duration(category),
                    current.category_duration(category),
                ),
            )
        })
        .collect();

    PeriodComparison {
        previous: previous.period,
        current: current.period,
        total: MetricChange::between(previous.total_duration_secs, current.total_duration_secs),
        by_category,
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Read-only view over the store and CurrentState for statistics.
pub struct Aggregator<S: PlaceStore> {
    store: SharedStore<S>,
    current: CurrentStateReader,
    top_n: usize,
}

impl<S: PlaceStore> Aggregator<S> {
    pub fn new(store: SharedStore<S>, current: CurrentStateReader) -> Self {
        Self {
            store,
            current,
            top_n: DEFAULT_TOP_PLACES,
        }
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn stats(&self, period: &StatsPeriod, now: Timestamp) -> Result<PeriodStats> {
        let (visits, places) = {
            let store = lock_store(&self.store)?;
            (store.visits_in_range(&period.range)?, store.places()?)
        };
        let current = self.current.snapshot();
        let stats = aggregate(period, &visits, &places, &current, now, self.top_n);
        log::debug!(
            "[Aggregator] {:?} {}..{}: {} visits, {}s",
            period.kind,
            period.range.start,
            period.range.end,
            stats.total_visits,
            stats.total_duration_secs
        );
        Ok(stats)
    }

    /// Compare `current` with the period before it.
    pub fn compare_with_previous(
        &self,
        current: &StatsPeriod,
        utc_offset_secs: i32,
        now: Timestamp,
    ) -> Result<PeriodComparison> {
        let previous = current.previous(utc_offset_secs)?;
        Ok(compare(&self.stats(&previous, now)?, &self.stats(current, now)?))
    }
}

//! # Place Engine
//!
//! Stateful engine wiring the pipeline together:
//!
//! ```text
//! Fix --> LocationFilter --> store + ProximityDetector --+
//!                                                         v
//! PlatformEvent --> EventQueue -------------------> VisitTracker --> Visits
//!
//! accepted fixes --(every N)--> background detection --> Places
//! Visits + Places + CurrentState (read-only) --> Aggregator --> PeriodStats
//! ```
//!
//! Fix ingestion is synchronous and cheap. Clustering runs as a background
//! batch pass, triggered explicitly or after `detection_batch_size` newly
//! accepted fixes. All visit transitions go through the tracker mutex.
//!
//! The reconciliation sweep runs from [`PlaceEngine::ingest_fix`] at most once
//! per `sweep_interval_mins` of fix time. A host that stops delivering fixes,
//! or sets the interval to 0, calls [`PlaceEngine::run_reconciliation`] itself.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::analytics::{Aggregator, PeriodComparison, PeriodKind, PeriodStats, StatsPeriod};
use crate::categorizer::{AutoAcceptThresholds, Correction};
use crate::clustering::ClusterConfig;
use crate::detection::{spawn_detection, DetectionHandle, DetectionJob, DetectionReport};
use crate::error::{OptionExt, PlaceTrackerError, Result};
use crate::filter::{FilterConfig, FilterDecision, LocationFilter};
use crate::proximity::ProximityDetector;
use crate::queue::EventQueue;
use crate::store::{lock_store, MemoryStore, PlaceStore, SharedStore};
use crate::visits::{CurrentStateReader, PlatformEvent, TrackerDiagnostics, TransitionOutcome, VisitConfig, VisitTracker};
use crate::{Category, CurrentState, Fix, Place, PlaceId, PlaceStatus, TimeRange, Timestamp, Visit};

// ============================================================================
// Configuration
// ============================================================================

/// Full engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub filter: FilterConfig,
    pub cluster: ClusterConfig,
    pub auto_accept: AutoAcceptThresholds,
    pub visits: VisitConfig,
    /// Offset of local time from UTC, used for histograms and period
    /// boundaries. Default: 0
    pub utc_offset_secs: i32,
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| PlaceTrackerError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let f = &self.filter;
        let c = &self.cluster;
        let a = &self.auto_accept;
        let v = &self.visits;

        let checks: [(bool, &str); 17] = [
            (f.accuracy_threshold_m > 0.0, "filter.accuracy_threshold_m must be > 0"),
            (f.moving_threshold_m >= 0.0, "filter.moving_threshold_m must be >= 0"),
            (
                f.stationary_threshold_m >= f.moving_threshold_m,
                "filter.stationary_threshold_m must be >= moving_threshold_m",
            ),
            (f.speed_ceiling_mps > 0.0, "filter.speed_ceiling_mps must be > 0"),
            (f.min_interval_secs >= 0, "filter.min_interval_secs must be >= 0"),
            (f.relax_after_secs > 0, "filter.relax_after_secs must be > 0"),
            (
                f.relax_factor >= 1.0 && f.relax_ceiling >= 1.0,
                "filter.relax_factor and relax_ceiling must be >= 1",
            ),
            (c.eps_m > 0.0, "cluster.eps_m must be > 0"),
            (c.min_pts >= 1, "cluster.min_pts must be >= 1"),
            (
                c.radius_percentile > 0.0 && c.radius_percentile <= 100.0,
                "cluster.radius_percentile must be in (0, 100]",
            ),
            (c.min_radius_m > 0.0, "cluster.min_radius_m must be > 0"),
            (
                c.detection_batch_size >= 1 && c.detection_window_days >= 1,
                "cluster.detection_batch_size and detection_window_days must be >= 1",
            ),
            (
                [a.auto_accept_confidence, a.min_acceptance_rate, a.reject_below_confidence]
                    .iter()
                    .all(|t| (0.0..=1.0).contains(t)),
                "auto_accept thresholds must be in [0, 1]",
            ),
            (v.reconciliation_cap_hours > 0, "visits.reconciliation_cap_hours must be > 0"),
            (
                v.proximity_exit_factor >= 1.0 && v.event_queue_capacity >= 1,
                "visits.proximity_exit_factor must be >= 1 and event_queue_capacity >= 1",
            ),
            (v.sweep_interval_mins >= 0, "visits.sweep_interval_mins must be >= 0"),
            (
                self.utc_offset_secs.abs() < 86_400,
                "utc_offset_secs must be within one day",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(PlaceTrackerError::config(*message)),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Engine statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub fix_count: u32,
    pub fixes_accepted: u64,
    pub fixes_rejected: u64,
    pub place_count: u32,
    pub pending_review_count: u32,
    pub open_visit_count: u32,
    pub detection_running: bool,
    pub diagnostics: TrackerDiagnostics,
}

type SharedTracker<S> = Arc<Mutex<VisitTracker<S>>>;

fn lock_tracker<S: PlaceStore>(tracker: &SharedTracker<S>) -> Result<MutexGuard<'_, VisitTracker<S>>> {
    tracker.lock().map_err(|_| PlaceTrackerError::Internal {
        message: "visit tracker lock poisoned".to_string(),
    })
}

/// Place detection and visit tracking engine.
pub struct PlaceEngine<S: PlaceStore + 'static = MemoryStore> {
    config: EngineConfig,
    store: SharedStore<S>,
    filter: LocationFilter,
    proximity: ProximityDetector,
    tracker: SharedTracker<S>,
    current: CurrentStateReader,
    aggregator: Aggregator<S>,
    detection_generation: Arc<AtomicU64>,
    detection: Option<DetectionHandle>,
    last_report: Option<DetectionReport>,
    fixes_since_detection: usize,
    fixes_accepted: u64,
    fixes_rejected: u64,
    last_sweep: Option<Timestamp>,
}

impl PlaceEngine<MemoryStore> {
    /// Engine backed by an in-memory store.
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::new(MemoryStore::shared(), config)
    }
}

impl<S: PlaceStore + 'static> PlaceEngine<S> {
    /// Create an engine over `store`. Restores and reconciles CurrentState.
    pub fn new(store: SharedStore<S>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let tracker = VisitTracker::new(Arc::clone(&store), config.visits.clone())?;
        let current = tracker.reader();
        let aggregator = Aggregator::new(Arc::clone(&store), current.clone());

        log::info!(
            "[PlaceEngine] Started (eps={}m, min_pts={}, cap={}h)",
            config.cluster.eps_m,
            config.cluster.min_pts,
            config.visits.reconciliation_cap_hours
        );

        Ok(Self {
            filter: LocationFilter::new(config.filter.clone()),
            proximity: ProximityDetector::new(config.visits.proximity_exit_factor),
            tracker: Arc::new(Mutex::new(tracker)),
            current,
            aggregator,
            detection_generation: Arc::new(AtomicU64::new(0)),
            detection: None,
            last_report: None,
            fixes_since_detection: 0,
            fixes_accepted: 0,
            fixes_rejected: 0,
            last_sweep: None,
            store,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared handle to the underlying store.
    pub fn store(&self) -> SharedStore<S> {
        Arc::clone(&self.store)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Filter a fix, persist it when accepted and derive proximity events.
    ///
    /// The filter only moves past an accepted fix once it is stored, so a
    /// fix whose write failed can be retried. Runs the reconciliation sweep
    /// when due and starts a background detection pass once enough fixes
    /// accumulated.
    pub fn ingest_fix(&mut self, fix: Fix) -> Result<FilterDecision> {
        let (decision, next) = self.filter.evaluate(&fix);
        if !decision.is_accept() {
            self.filter.commit(next);
            self.fixes_rejected += 1;
            return Ok(decision);
        }

        let places = {
            let mut store = lock_store(&self.store)?;
            store.insert_fix(&fix)?;
            store.places()?
        };
        self.filter.commit(next);
        self.fixes_accepted += 1;

        let interval = self.config.visits.sweep_interval_secs();
        let sweep_due = interval > 0 && self.last_sweep.map_or(true, |t| fix.timestamp - t >= interval);
        {
            let mut tracker = lock_tracker(&self.tracker)?;
            if sweep_due {
                // Before note_fix: a forced exit lands on the previous fix
                tracker.reconciliation_sweep(fix.timestamp)?;
                self.last_sweep = Some(fix.timestamp);
            }
            tracker.note_fix(fix.timestamp)?;
            self.proximity.sync(tracker.current_state().current_place_id);
            for event in self.proximity.observe(&fix, &places) {
                tracker.apply(&event)?;
            }
        }

        self.fixes_since_detection += 1;
        if self.fixes_since_detection >= self.config.cluster.detection_batch_size {
            log::info!(
                "[PlaceEngine] {} new fixes, starting detection",
                self.fixes_since_detection
            );
            self.request_detection(fix.timestamp);
        }

        Ok(decision)
    }

    /// Apply a platform event synchronously. Corrections yield `None`.
    pub fn handle_event(&self, event: &PlatformEvent) -> Result<Option<TransitionOutcome>> {
        match event {
            PlatformEvent::Correction(c) => {
                apply_correction(&self.store, c.place_id, c.category)?;
                Ok(None)
            }
            boundary => Ok(Some(lock_tracker(&self.tracker)?.apply(boundary)?)),
        }
    }

    /// Start a queue whose single worker applies platform events to this
    /// engine's tracker and store.
    pub fn spawn_event_queue(&self) -> EventQueue {
        let tracker = Arc::clone(&self.tracker);
        let store = Arc::clone(&self.store);
        EventQueue::spawn(self.config.visits.event_queue_capacity, move |event| match event {
            PlatformEvent::Correction(c) => apply_correction(&store, c.place_id, c.category).map(|_| ()),
            boundary => lock_tracker(&tracker)?.apply(&boundary).map(|_| ()),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_places(&self) -> Result<Vec<Place>> {
        lock_store(&self.store)?.places()
    }

    pub fn get_place(&self, place_id: PlaceId) -> Result<Place> {
        lock_store(&self.store)?.get_place(place_id)?.ok_or_unknown_place(place_id)
    }

    /// Visits overlapping `range`, ordered by entry time.
    pub fn get_visits(&self, range: &TimeRange) -> Result<Vec<Visit>> {
        lock_store(&self.store)?.visits_in_range(range)
    }

    pub fn get_current_state(&self) -> CurrentState {
        self.current.snapshot()
    }

    /// Read-only CurrentState handle for other consumers.
    pub fn current_state_reader(&self) -> CurrentStateReader {
        self.current.clone()
    }

    // ========================================================================
    // Detection
    // ========================================================================

    /// Start a background detection pass, superseding any running one.
    /// Returns the pass generation.
    pub fn request_detection(&mut self, now: Timestamp) -> u64 {
        let job = DetectionJob {
            cluster: self.config.cluster.clone(),
            thresholds: self.config.auto_accept.clone(),
            utc_offset_secs: self.config.utc_offset_secs,
            now,
        };
        let handle = spawn_detection(Arc::clone(&self.store), job, Arc::clone(&self.detection_generation));
        let generation = handle.generation();
        if self.detection.replace(handle).is_some() {
            log::info!("[PlaceEngine] Detection pass {} supersedes the running one", generation);
        }
        self.fixes_since_detection = 0;
        generation
    }

    pub fn is_detection_running(&self) -> bool {
        self.detection.is_some()
    }

    /// Check for a finished detection pass (non-blocking).
    pub fn poll_detection(&mut self) -> Option<Result<DetectionReport>> {
        let result = self.detection.as_ref()?.try_recv()?;
        self.detection = None;
        self.remember(result)
    }

    /// Wait for the latest detection pass to finish.
    pub fn wait_for_detection(&mut self) -> Option<Result<DetectionReport>> {
        let result = self.detection.take()?.recv();
        self.remember(result)
    }

    pub fn last_detection_report(&self) -> Option<&DetectionReport> {
        self.last_report.as_ref()
    }

    fn remember(&mut self, result: Result<DetectionReport>) -> Option<Result<DetectionReport>> {
        if let Ok(report) = &result {
            self.last_report = Some(report.clone());
        }
        Some(result)
    }

    // ========================================================================
    // Review and corrections
    // ========================================================================

    /// Set a place's category and learn from the correction.
    pub fn record_correction(&self, place_id: PlaceId, category: Category) -> Result<Place> {
        apply_correction(&self.store, place_id, category)
    }

    /// Accept a place awaiting review.
    pub fn confirm_place(&self, place_id: PlaceId) -> Result<Place> {
        let mut store = lock_store(&self.store)?;
        let mut place = store.get_place(place_id)?.ok_or_unknown_place(place_id)?;
        let mut profile = store.load_profile()?.unwrap_or_default();
        profile.record_acceptance(place.category);
        place.status = PlaceStatus::Confirmed;
        store.upsert_place(&place)?;
        store.save_profile(&profile)?;
        log::info!("[PlaceEngine] Confirmed place {} as {}", place_id, place.category);
        Ok(place)
    }

    /// Reject a detected place: learn from it, remember its area so
    /// detection does not propose it again, and delete it.
    pub fn reject_place(&mut self, place_id: PlaceId) -> Result<()> {
        {
            let mut store = lock_store(&self.store)?;
            let place = store.get_place(place_id)?.ok_or_unknown_place(place_id)?;
            let mut profile = store.load_profile()?.unwrap_or_default();
            profile.record_rejection(place.category);
            profile.record_rejected_area(place.center(), place.radius_m);
            store.save_profile(&profile)?;
        }
        self.delete_place(place_id)?;
        Ok(())
    }

    /// Delete a place and its visits. Returns false if it did not exist.
    pub fn delete_place(&mut self, place_id: PlaceId) -> Result<bool> {
        let mut tracker = lock_tracker(&self.tracker)?;
        tracker.forget_place(place_id)?;
        let deleted = lock_store(&self.store)?.delete_place(place_id)?;
        self.proximity.forget(place_id);
        if deleted {
            log::info!("[PlaceEngine] Deleted place {}", place_id);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Resolve the day/week/month containing `ts` in local time.
    pub fn period_containing(&self, kind: PeriodKind, ts: Timestamp) -> Result<StatsPeriod> {
        let offset = self.config.utc_offset_secs;
        match kind {
            PeriodKind::Day => StatsPeriod::day_containing(ts, offset),
            PeriodKind::Week => StatsPeriod::week_containing(ts, offset),
            PeriodKind::Month => StatsPeriod::month_containing(ts, offset),
            PeriodKind::Custom => Err(PlaceTrackerError::config(
                "custom periods need an explicit range",
            )),
        }
    }

    pub fn get_stats(&self, period: &StatsPeriod, now: Timestamp) -> Result<PeriodStats> {
        self.aggregator.stats(period, now)
    }

    /// Compare `period` with the one before it.
    pub fn compare_periods(&self, period: &StatsPeriod, now: Timestamp) -> Result<PeriodComparison> {
        self.aggregator
            .compare_with_previous(period, self.config.utc_offset_secs, now)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Force-close visits left open past the reconciliation cap.
    pub fn run_reconciliation(&self, now: Timestamp) -> Result<Vec<Visit>> {
        lock_tracker(&self.tracker)?.reconciliation_sweep(now)
    }

    /// Drop stored fixes older than `cutoff`.
    pub fn prune_fixes_before(&self, cutoff: Timestamp) -> Result<usize> {
        let removed = lock_store(&self.store)?.prune_fixes_before(cutoff)?;
        log::info!("[PlaceEngine] Pruned {} fixes before {}", removed, cutoff);
        Ok(removed)
    }

    pub fn diagnostics(&self) -> Result<TrackerDiagnostics> {
        Ok(lock_tracker(&self.tracker)?.diagnostics())
    }

    /// Get engine statistics.
    pub fn stats(&self) -> Result<EngineStats> {
        let diagnostics = self.diagnostics()?;
        let store = lock_store(&self.store)?;
        let places = store.places()?;

        Ok(EngineStats {
            fix_count: store.fix_count()? as u32,
            fixes_accepted: self.fixes_accepted,
            fixes_rejected: self.fixes_rejected,
            place_count: places.len() as u32,
            pending_review_count: places
                .iter()
                .filter(|p| p.status == PlaceStatus::PendingReview)
                .count() as u32,
            open_visit_count: store.open_visits()?.len() as u32,
            detection_running: self.detection.is_some(),
            diagnostics,
        })
    }
}

/// Set a place's category, mark it user-corrected and update the profile.
fn apply_correction<S: PlaceStore>(store: &SharedStore<S>, place_id: PlaceId, category: Category) -> Result<Place> {
    let mut store = lock_store(store)?;
    let mut place = store.get_place(place_id)?.ok_or_unknown_place(place_id)?;
    let mut profile = store.load_profile()?.unwrap_or_default();

    profile.learn(&Correction {
        place_id,
        from: place.category,
        to: category,
    });
    log::info!(
        "[PlaceEngine] Correction for place {}: {} -> {}",
        place_id,
        place.category,
        category
    );

    place.category = category;
    place.user_corrected = true;
    place.status = PlaceStatus::Confirmed;
    store.upsert_place(&place)?;
    store.save_profile(&profile)?;
    Ok(place)
}

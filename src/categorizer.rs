//! # Categorizer
//!
//! Assigns a [`Category`] and confidence to a cluster, learns from user
//! corrections, and gates new places through the auto-accept policy.
//!
//! Scoring blends local hour-of-day and day-of-week histograms of the member
//! fixes with built-in priors per category, scaled by the learned weight in
//! the [`CategoryProfile`].
//!
//! ## Learning rule
//! On a correction `X -> Y`: `weight(Y) += 0.1`, `weight(X) -= 0.1`, both
//! clamped to `[0, 1]`, and X's review history records a rejection. A
//! confirmation of X records an acceptance. The acceptance rate is
//! `(accepted + 1) / (accepted + rejected + 2)`, so a category without history
//! sits at 0.5.
//!
//! A place the user rejects leaves a [`RejectedArea`] behind; detection does
//! not propose new places there again.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{Datelike, Timelike};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::clustering::Cluster;
use crate::geo_utils::haversine_distance;
use crate::{local_datetime, Category, Fix, GpsPoint, PlaceId};

/// Weight increase for the corrected-to category.
pub const LEARNING_DELTA_UP: f64 = 0.1;
/// Weight decrease for the corrected-from category.
pub const LEARNING_DELTA_DOWN: f64 = 0.1;
/// Initial weight for every category.
pub const DEFAULT_WEIGHT: f64 = 0.5;

const HOUR_SHARE: f64 = 0.7;
const WEEKDAY_SHARE: f64 = 0.3;

// ============================================================================
// Priors
// ============================================================================

struct CategoryPrior {
    hours: [f64; 24],
    /// Monday first
    weekdays: [f64; 7],
}

fn hours_from(ranges: &[(RangeInclusive<usize>, f64)], default: f64) -> [f64; 24] {
    let mut hours = [default; 24];
    for (range, value) in ranges {
        for h in range.clone() {
            hours[h] = *value;
        }
    }
    hours
}

static CATEGORY_PRIORS: Lazy<Vec<(Category, CategoryPrior)>> = Lazy::new(|| {
    vec![
        (
            Category::Home,
            CategoryPrior {
                hours: hours_from(
                    &[(0..=6, 1.0), (7..=7, 0.8), (8..=8, 0.5), (17..=17, 0.4), (18..=18, 0.6), (19..=19, 0.8), (20..=23, 1.0)],
                    0.2,
                ),
                weekdays: [0.9, 0.9, 0.9, 0.9, 0.9, 1.0, 1.0],
            },
        ),
        (
            Category::Work,
            CategoryPrior {
                hours: hours_from(
                    &[(7..=7, 0.3), (8..=8, 0.8), (9..=16, 1.0), (17..=17, 0.8), (18..=18, 0.4), (19..=19, 0.15)],
                    0.05,
                ),
                weekdays: [1.0, 1.0, 1.0, 1.0, 1.0, 0.2, 0.1],
            },
        ),
        (
            Category::Gym,
            CategoryPrior {
                hours: hours_from(
                    &[(6..=8, 0.9), (9..=11, 0.4), (12..=13, 0.6), (14..=16, 0.4), (17..=20, 0.9), (21..=21, 0.5)],
                    0.05,
                ),
                weekdays: [0.7; 7],
            },
        ),
        (
            Category::Shopping,
            CategoryPrior {
                hours: hours_from(&[(9..=9, 0.4), (10..=19, 0.8), (20..=20, 0.4)], 0.05),
                weekdays: [0.5, 0.5, 0.5, 0.5, 0.6, 1.0, 0.7],
            },
        ),
        (
            Category::Dining,
            CategoryPrior {
                hours: hours_from(
                    &[(11..=11, 0.5), (12..=13, 1.0), (14..=14, 0.5), (17..=17, 0.5), (18..=21, 1.0), (22..=22, 0.5)],
                    0.05,
                ),
                weekdays: [0.7, 0.7, 0.7, 0.7, 1.0, 1.0, 0.7],
            },
        ),
        (
            Category::Social,
            CategoryPrior {
                hours: hours_from(&[(0..=1, 0.6), (14..=17, 0.4), (18..=23, 0.9)], 0.1),
                weekdays: [0.4, 0.4, 0.4, 0.5, 0.8, 1.0, 0.7],
            },
        ),
        (
            Category::Other,
            CategoryPrior {
                hours: [0.3; 24],
                weekdays: [0.3; 7],
            },
        ),
    ]
});

// ============================================================================
// Cluster context
// ============================================================================

/// What the categorizer knows about a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterContext {
    /// Member fixes per local hour of day
    pub hour_histogram: [u32; 24],
    /// Member fixes per local weekday, Monday first
    pub weekday_histogram: [u32; 7],
    pub member_count: usize,
    /// Spatial confidence from the clustering pass
    pub cluster_confidence: f64,
}

impl ClusterContext {
    /// Build the context from a cluster and the fixes it indexes into.
    pub fn from_cluster(cluster: &Cluster, fixes: &[Fix], utc_offset_secs: i32) -> Self {
        let timestamps = cluster
            .member_indices
            .iter()
            .filter_map(|&i| fixes.get(i))
            .map(|f| f.timestamp);
        Self::from_timestamps(timestamps, cluster.confidence, utc_offset_secs)
    }

    /// Build the context from raw member timestamps.
    pub fn from_timestamps(
        timestamps: impl IntoIterator<Item = i64>,
        cluster_confidence: f64,
        utc_offset_secs: i32,
    ) -> Self {
        let mut hour_histogram = [0u32; 24];
        let mut weekday_histogram = [0u32; 7];
        let mut member_count = 0;

        for ts in timestamps {
            if let Some(local) = local_datetime(ts, utc_offset_secs) {
                hour_histogram[local.hour() as usize] += 1;
                weekday_histogram[local.weekday().num_days_from_monday() as usize] += 1;
                member_count += 1;
            }
        }

        Self {
            hour_histogram,
            weekday_histogram,
            member_count,
            cluster_confidence: cluster_confidence.clamp(0.0, 1.0),
        }
    }
}

// ============================================================================
// Category profile
// ============================================================================

/// Review outcomes for places auto-labelled with a category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewHistory {
    pub accepted: u32,
    pub rejected: u32,
}

/// Footprint of a place the user rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedArea {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl RejectedArea {
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Learned per-category weights, review history and rejected areas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryProfile {
    pub weights: BTreeMap<Category, f64>,
    pub reviews: BTreeMap<Category, ReviewHistory>,
    #[serde(default)]
    pub rejected_areas: Vec<RejectedArea>,
}

impl Default for CategoryProfile {
    fn default() -> Self {
        Self {
            weights: Category::ALL.iter().map(|&c| (c, DEFAULT_WEIGHT)).collect(),
            reviews: BTreeMap::new(),
            rejected_areas: Vec::new(),
        }
    }
}

impl CategoryProfile {
    pub fn weight(&self, category: Category) -> f64 {
        self.weights.get(&category).copied().unwrap_or(DEFAULT_WEIGHT)
    }

    /// Apply a user correction (see module docs for the update rule).
    pub fn learn(&mut self, correction: &Correction) {
        if correction.from == correction.to {
            self.record_acceptance(correction.to);
            return;
        }
        let up = (self.weight(correction.to) + LEARNING_DELTA_UP).clamp(0.0, 1.0);
        let down = (self.weight(correction.from) - LEARNING_DELTA_DOWN).clamp(0.0, 1.0);
        self.weights.insert(correction.to, up);
        self.weights.insert(correction.from, down);
        self.reviews.entry(correction.from).or_default().rejected += 1;
    }

    pub fn record_acceptance(&mut self, category: Category) {
        self.reviews.entry(category).or_default().accepted += 1;
    }

    pub fn record_rejection(&mut self, category: Category) {
        self.reviews.entry(category).or_default().rejected += 1;
    }

    /// Remember the footprint of a rejected place.
    pub fn record_rejected_area(&mut self, center: GpsPoint, radius_m: f64) {
        self.rejected_areas.push(RejectedArea {
            latitude: center.latitude,
            longitude: center.longitude,
            radius_m,
        });
    }

    /// First rejected area whose radius, widened to at least `min_radius_m`
    /// and scaled by `factor`, contains `point`.
    pub fn rejected_area_containing(
        &self,
        point: &GpsPoint,
        min_radius_m: f64,
        factor: f64,
    ) -> Option<&RejectedArea> {
        self.rejected_areas
            .iter()
            .find(|a| haversine_distance(&a.center(), point) <= a.radius_m.max(min_radius_m) * factor)
    }

    /// Laplace-smoothed acceptance rate in `(0, 1)`.
    pub fn acceptance_rate(&self, category: Category) -> f64 {
        let h = self.reviews.get(&category).copied().unwrap_or_default();
        (h.accepted as f64 + 1.0) / (h.accepted as f64 + h.rejected as f64 + 2.0)
    }
}

/// A user correction of a place's category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub place_id: PlaceId,
    pub from: Category,
    pub to: Category,
}

// ============================================================================
// Categorization
// ============================================================================

fn histogram_fit<const N: usize>(histogram: &[u32; N], prior: &[f64; N]) -> f64 {
    let total: u32 = histogram.iter().sum();
    if total == 0 {
        return 0.0;
    }
    histogram
        .iter()
        .zip(prior.iter())
        .map(|(&count, &p)| count as f64 / total as f64 * p)
        .sum()
}

/// How well the context matches a category's priors, in `[0, 1]`.
fn prior_fit(ctx: &ClusterContext, prior: &CategoryPrior) -> f64 {
    HOUR_SHARE * histogram_fit(&ctx.hour_histogram, &prior.hours)
        + WEEKDAY_SHARE * histogram_fit(&ctx.weekday_histogram, &prior.weekdays)
}

/// Pick the best category and its confidence in `[0, 1]`.
///
/// Ties resolve to the earlier category in [`Category::ALL`].
pub fn categorize(ctx: &ClusterContext, profile: &CategoryProfile) -> (Category, f64) {
    if ctx.member_count == 0 {
        return (Category::Other, 0.0);
    }

    let mut best: Option<(Category, f64, f64)> = None;
    for (category, prior) in CATEGORY_PRIORS.iter() {
        let fit = prior_fit(ctx, prior);
        let score = fit * profile.weight(*category);
        match best {
            Some((_, best_score, _)) if score <= best_score => {}
            _ => best = Some((*category, score, fit)),
        }
    }

    let Some((category, _, fit)) = best else {
        return (Category::Other, 0.0);
    };
    let weight_factor = 0.5 + profile.weight(category);
    let confidence = (ctx.cluster_confidence * fit * weight_factor).clamp(0.0, 1.0);
    (category, confidence)
}

// ============================================================================
// Auto-accept policy
// ============================================================================

/// Thresholds for the auto-accept policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAcceptThresholds {
    /// Confidence at or above which a place may be auto-accepted.
    /// Default: 0.6
    pub auto_accept_confidence: f64,
    /// Historical acceptance rate required for auto-accept. Default: 0.5
    pub min_acceptance_rate: f64,
    /// Confidence below which a candidate is dropped. Default: 0.15
    pub reject_below_confidence: f64,
}

impl Default for AutoAcceptThresholds {
    fn default() -> Self {
        Self {
            auto_accept_confidence: 0.6,
            min_acceptance_rate: 0.5,
            reject_below_confidence: 0.15,
        }
    }
}

/// Gate for new places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaceDecision {
    AutoAccept,
    NeedsReview,
    Reject,
}

pub fn auto_accept_decision(
    confidence: f64,
    acceptance_rate: f64,
    thresholds: &AutoAcceptThresholds,
) -> PlaceDecision {
    if confidence < thresholds.reject_below_confidence {
        PlaceDecision::Reject
    } else if confidence >= thresholds.auto_accept_confidence
        && acceptance_rate >= thresholds.min_acceptance_rate
    {
        PlaceDecision::AutoAccept
    } else {
        PlaceDecision::NeedsReview
    }
}

/// Result of evaluating a candidate cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub category: Category,
    pub confidence: f64,
    pub decision: PlaceDecision,
}

/// Categorizer with a profile and policy thresholds.
#[derive(Debug, Clone, Default)]
pub struct Categorizer {
    profile: CategoryProfile,
    thresholds: AutoAcceptThresholds,
}

impl Categorizer {
    pub fn new(profile: CategoryProfile, thresholds: AutoAcceptThresholds) -> Self {
        Self { profile, thresholds }
    }

    pub fn categorize(&self, ctx: &ClusterContext) -> (Category, f64) {
        categorize(ctx, &self.profile)
    }

    /// Categorize and apply the auto-accept policy.
    pub fn assess(&self, ctx: &ClusterContext) -> Assessment {
        let (category, confidence) = self.categorize(ctx);
        let rate = self.profile.acceptance_rate(category);
        let decision = auto_accept_decision(confidence, rate, &self.thresholds);
        log::debug!(
            "[Categorizer] {} members -> {:?} (confidence {:.2}, acceptance {:.2}) => {:?}",
            ctx.member_count,
            category,
            confidence,
            rate,
            decision
        );
        Assessment {
            category,
            confidence,
            decision,
        }
    }

    pub fn profile(&self) -> &CategoryProfile {
        &self.profile
    }
}

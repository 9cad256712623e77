//! # Place Tracker
//!
//! Turns a continuous stream of raw GPS fixes into a small set of meaningful
//! places, tracks visits to them with enter/exit semantics, and rolls visits
//! up into day/week/month statistics.
//!
//! This library provides:
//! - An adaptive per-fix location filter
//! - Density-based place clustering (DBSCAN on haversine distance)
//! - Category assignment with learning from user corrections
//! - A visit state machine tolerant of duplicated, delayed and out-of-order
//!   boundary events
//! - Period statistics with trend comparison
//!
//! ## Features
//!
//! - **`parallel`** - Parallel neighborhood computation with rayon
//! - **`persistence`** - SQLite-backed [`PlaceStore`](store::PlaceStore)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use place_tracker::{Fix, clustering};
//!
//! let fixes: Vec<Fix> = (0..12)
//!     .map(|i| Fix::new(47.3769 + i as f64 * 0.00001, 8.5417, 10.0, i * 60))
//!     .collect();
//!
//! let clusters = clustering::cluster(&fixes, 50.0, 3);
//! assert_eq!(clusters.len(), 1);
//! ```

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, PlaceTrackerError, Result};

// Geographic utilities (distance, centroid, percentile radius)
pub mod geo_utils;

// Per-fix accept/reject decisions
pub mod filter;
pub use filter::{FilterConfig, FilterDecision, FilterState, LocationFilter, MotionMode, RejectReason};

// Density-based place clustering
pub mod clustering;
pub use clustering::{cluster, cluster_with_config, Cluster, ClusterConfig};

// Category assignment, learning and the auto-accept policy
pub mod categorizer;
pub use categorizer::{
    AutoAcceptThresholds, Categorizer, CategoryProfile, ClusterContext, Correction, PlaceDecision,
    RejectedArea,
};

// Persistence collaborator interface and in-memory implementation
pub mod store;
pub use store::{MemoryStore, PlaceStore, SharedStore};

// SQLite-backed store
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// Visit state machine
pub mod visits;
pub use visits::{
    BoundaryEvent, CurrentStateReader, EventSource, PlatformEvent, TrackerDiagnostics,
    TrackerPhase, TransitionOutcome, VisitConfig, VisitTracker,
};

// Proximity-derived enter/exit events
pub mod proximity;
pub use proximity::ProximityDetector;

// Bounded event queue with a single writer loop
pub mod queue;
pub use queue::EventQueue;

// Day/week/month statistics and trend comparison
pub mod analytics;
pub use analytics::{Change, PeriodComparison, PeriodKind, PeriodStats, StatsPeriod, Trend};

// Background place detection
pub mod detection;
pub use detection::{DetectionHandle, DetectionReport, DetectionStatus};

// Top-level engine wiring everything together
pub mod engine;
pub use engine::{EngineConfig, EngineStats, PlaceEngine};

// ============================================================================
// Core Types
// ============================================================================

/// Place identifier.
pub type PlaceId = u64;

/// Visit identifier.
pub type VisitId = u64;

/// Unix timestamp in seconds.
pub type Timestamp = i64;

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use place_tracker::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Source of a location reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Gps,
    Network,
    Fused,
    Passive,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gps => "gps",
            Provider::Network => "network",
            Provider::Fused => "fused",
            Provider::Passive => "passive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gps" => Some(Provider::Gps),
            "network" => Some(Provider::Network),
            "fused" => Some(Provider::Fused),
            "passive" => Some(Provider::Passive),
            _ => None,
        }
    }
}

/// One raw timestamped location reading. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters (lower is better)
    pub accuracy_m: f64,
    pub speed_mps: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub timestamp: Timestamp,
    pub provider: Provider,
}

impl Fix {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64, timestamp: Timestamp) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m,
            speed_mps: None,
            bearing_deg: None,
            timestamp,
            provider: Provider::Gps,
        }
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    pub fn with_bearing(mut self, bearing_deg: f64) -> Self {
        self.bearing_deg = Some(bearing_deg);
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    pub fn is_valid(&self) -> bool {
        self.point().is_valid() && self.accuracy_m.is_finite() && self.accuracy_m >= 0.0
    }
}

/// Semantic category of a place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Home,
    Work,
    Gym,
    Shopping,
    Dining,
    Social,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Home,
        Category::Work,
        Category::Gym,
        Category::Shopping,
        Category::Dining,
        Category::Social,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Home => "home",
            Category::Work => "work",
            Category::Gym => "gym",
            Category::Shopping => "shopping",
            Category::Dining => "dining",
            Category::Social => "social",
            Category::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Category::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review status of a place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceStatus {
    #[default]
    Confirmed,
    PendingReview,
}

/// A spatial cluster of fixes representing a location of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub id: PlaceId,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
    /// Always > 0
    pub radius_m: f64,
    pub category: Category,
    /// In `[0, 1]`
    pub confidence: f64,
    pub visit_count: u32,
    /// Seconds spent across closed visits
    pub total_time_spent_secs: i64,
    pub status: PlaceStatus,
    /// Category was set by the user; detection no longer overrides it
    pub user_corrected: bool,
    pub created_at: Timestamp,
}

impl Place {
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(self.centroid_lat, self.centroid_lon)
    }

    /// Distance in meters from the place centroid.
    pub fn distance_to(&self, point: &GpsPoint) -> f64 {
        geo_utils::haversine_distance(&self.center(), point)
    }

    pub fn contains(&self, point: &GpsPoint) -> bool {
        self.distance_to(point) <= self.radius_m
    }
}

/// A time interval binding presence to a place.
///
/// `entry_time < exit_time` once closed. `duration_secs` is 0 while open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub id: VisitId,
    pub place_id: PlaceId,
    pub entry_time: Timestamp,
    pub exit_time: Option<Timestamp>,
    pub duration_secs: i64,
    /// Force-closed by the reconciliation sweep
    pub reconciled: bool,
}

impl Visit {
    pub fn open(id: VisitId, place_id: PlaceId, entry_time: Timestamp) -> Self {
        Self {
            id,
            place_id,
            entry_time,
            exit_time: None,
            duration_secs: 0,
            reconciled: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.exit_time.is_none()
    }

    /// Close at `exit_time`. The caller guarantees `exit_time > entry_time`.
    pub fn closed_at(&self, exit_time: Timestamp) -> Self {
        Self {
            exit_time: Some(exit_time),
            duration_secs: exit_time - self.entry_time,
            ..self.clone()
        }
    }

    /// End of the visit, or `now` while it is still open.
    pub fn effective_end(&self, now: Timestamp) -> Timestamp {
        self.exit_time.unwrap_or(now.max(self.entry_time))
    }
}

/// The presently active place/visit, if any. The only cross-component
/// mutable state; written only by the visit tracker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    pub current_place_id: Option<PlaceId>,
    pub current_visit_id: Option<VisitId>,
    pub last_fix_time: Option<Timestamp>,
    /// Time of the most recent resolved enter/exit
    pub last_transition_time: Option<Timestamp>,
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Seconds of `[from, to)` that fall inside this range.
    pub fn overlap_secs(&self, from: Timestamp, to: Timestamp) -> i64 {
        (to.min(self.end) - from.max(self.start)).max(0)
    }

    /// Whether an interval `[from, to)` touches this range. Open intervals
    /// pass `to = Timestamp::MAX`.
    pub fn overlaps(&self, from: Timestamp, to: Timestamp) -> bool {
        from < self.end && to > self.start
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).max(0)
    }
}

/// Convert a Unix timestamp into local time at a fixed UTC offset.
pub fn local_datetime(ts: Timestamp, utc_offset_secs: i32) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(utc_offset_secs)?;
    DateTime::from_timestamp(ts, 0).map(|dt| dt.with_timezone(&offset))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_fix_validation() {
        assert!(Fix::new(51.5, -0.12, 8.0, 0).is_valid());
        assert!(!Fix::new(51.5, -0.12, -1.0, 0).is_valid());
        assert!(!Fix::new(51.5, -0.12, f64::INFINITY, 0).is_valid());
    }

    #[test]
    fn test_visit_close() {
        let visit = Visit::open(1, 7, 36_000);
        assert!(visit.is_open());
        assert_eq!(visit.effective_end(40_000), 40_000);

        let closed = visit.closed_at(41_400);
        assert!(!closed.is_open());
        assert_eq!(closed.duration_secs, 5_400);
        assert_eq!(closed.effective_end(99_999), 41_400);
    }

    #[test]
    fn test_time_range_overlap() {
        let range = TimeRange::new(100, 200);
        assert_eq!(range.overlap_secs(50, 150), 50);
        assert_eq!(range.overlap_secs(150, 300), 50);
        assert_eq!(range.overlap_secs(300, 400), 0);
        assert!(range.overlaps(150, Timestamp::MAX));
        assert!(!range.overlaps(200, 300));
        assert!(range.contains(100));
        assert!(!range.contains(200));
    }

    #[test]
    fn test_category_round_trip_names() {
        for c in Category::ALL {
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
        assert_eq!(Category::parse("nope"), None);
    }
}

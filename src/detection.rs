//! # Place Detection
//!
//! Batch pass turning recent fixes into places: cluster, categorize, apply
//! the auto-accept policy, then match against the existing place table.
//! Clusters inside an area the user rejected never become new places.
//!
//! Passes run on a background thread and report through a
//! [`DetectionHandle`]. Each request bumps a shared generation counter; a
//! pass whose generation is no longer the latest stops before its next
//! cluster write. Every cluster is written with a single `upsert_place`,
//! so a superseded pass never leaves a partially written cluster.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::categorizer::{AutoAcceptThresholds, Categorizer, CategoryProfile, ClusterContext, PlaceDecision};
use crate::clustering::{cluster_with_config, Cluster, ClusterConfig};
use crate::error::{require_sufficient, PlaceTrackerError, Result};
use crate::geo_utils::haversine_distance;
use crate::store::{lock_store, PlaceStore, SharedStore};
use crate::{Place, PlaceId, PlaceStatus, TimeRange, Timestamp};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionStatus {
    Completed,
    /// Too few fixes in the window to form a single cluster
    InsufficientData,
    /// A newer request took over before this pass finished
    Superseded,
}

/// Outcome of one detection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub generation: u64,
    pub status: DetectionStatus,
    pub window: TimeRange,
    pub fixes_considered: usize,
    pub clusters_found: usize,
    pub places_created: Vec<PlaceId>,
    pub places_updated: Vec<PlaceId>,
    /// Clusters dropped by the auto-accept policy or a rejected area
    pub clusters_rejected: usize,
}

impl DetectionReport {
    fn new(generation: u64, window: TimeRange) -> Self {
        Self {
            generation,
            status: DetectionStatus::Completed,
            window,
            fixes_considered: 0,
            clusters_found: 0,
            places_created: Vec::new(),
            places_updated: Vec::new(),
            clusters_rejected: 0,
        }
    }
}

/// Handle for a background detection pass.
pub struct DetectionHandle {
    generation: u64,
    receiver: mpsc::Receiver<Result<DetectionReport>>,
}

impl DetectionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check if detection is complete (non-blocking).
    pub fn try_recv(&self) -> Option<Result<DetectionReport>> {
        self.receiver.try_recv().ok()
    }

    /// Wait for detection to complete (blocking).
    pub fn recv(self) -> Result<DetectionReport> {
        self.receiver.recv().map_err(|_| PlaceTrackerError::Internal {
            message: format!("detection pass {} ended without a report", self.generation),
        })?
    }
}

/// Parameters of one detection pass.
#[derive(Debug, Clone)]
pub struct DetectionJob {
    pub cluster: ClusterConfig,
    pub thresholds: AutoAcceptThresholds,
    pub utc_offset_secs: i32,
    pub now: Timestamp,
}

impl DetectionJob {
    pub fn window(&self) -> TimeRange {
        let days = self.cluster.detection_window_days.max(1);
        TimeRange::new(self.now - days * SECONDS_PER_DAY, self.now + 1)
    }
}

/// Start a detection pass in a background thread.
///
/// Bumps `latest` so that any running pass is superseded.
pub fn spawn_detection<S>(store: SharedStore<S>, job: DetectionJob, latest: Arc<AtomicU64>) -> DetectionHandle
where
    S: PlaceStore + 'static,
{
    let generation = latest.fetch_add(1, Ordering::SeqCst) + 1;
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let result = run_detection(&store, &job, generation, &latest);
        if let Err(e) = &result {
            log::error!("[Detection] Pass {} failed: {}", generation, e);
        }
        tx.send(result).ok();
    });

    DetectionHandle {
        generation,
        receiver: rx,
    }
}

/// Run a detection pass on the calling thread.
pub fn run_detection<S: PlaceStore>(
    store: &SharedStore<S>,
    job: &DetectionJob,
    generation: u64,
    latest: &AtomicU64,
) -> Result<DetectionReport> {
    let window = job.window();
    let mut report = DetectionReport::new(generation, window);

    let (fixes, profile) = {
        let store = lock_store(store)?;
        (store.fixes_in_range(&window)?, store.load_profile()?.unwrap_or_default())
    };
    report.fixes_considered = fixes.len();

    if let Err(e) = require_sufficient(fixes.len(), job.cluster.min_pts.max(1)) {
        log::info!("[Detection] Pass {}: {}", generation, e);
        report.status = DetectionStatus::InsufficientData;
        return Ok(report);
    }

    let clusters = cluster_with_config(&fixes, &job.cluster);
    report.clusters_found = clusters.len();
    let categorizer = Categorizer::new(profile, job.thresholds.clone());
    let mut matched: HashSet<PlaceId> = HashSet::new();

    for cluster in &clusters {
        if latest.load(Ordering::SeqCst) != generation {
            log::info!(
                "[Detection] Pass {} superseded after {} places",
                generation,
                report.places_created.len() + report.places_updated.len()
            );
            report.status = DetectionStatus::Superseded;
            return Ok(report);
        }

        let ctx = ClusterContext::from_cluster(cluster, &fixes, job.utc_offset_secs);
        let assessment = categorizer.assess(&ctx);

        let mut guard = lock_store(store)?;
        let places = guard.places()?;
        let existing = nearest_match(cluster, &places, &job.cluster);
        if existing.is_some_and(|p| matched.contains(&p.id)) {
            // Second cluster of this pass for the same place
            continue;
        }

        match existing {
            Some(place) => {
                let mut updated = place.clone();
                updated.centroid_lat = cluster.centroid.latitude;
                updated.centroid_lon = cluster.centroid.longitude;
                updated.radius_m = cluster.radius_m;
                if !place.user_corrected {
                    updated.category = assessment.category;
                    updated.confidence = assessment.confidence;
                }
                guard.upsert_place(&updated)?;
                matched.insert(updated.id);
                report.places_updated.push(updated.id);
            }
            None if in_rejected_area(cluster, categorizer.profile(), &job.cluster) => {
                log::debug!(
                    "[Detection] Pass {}: cluster at ({:.5}, {:.5}) lies in a rejected area",
                    generation,
                    cluster.centroid.latitude,
                    cluster.centroid.longitude
                );
                report.clusters_rejected += 1;
            }
            None => {
                let status = match assessment.decision {
                    PlaceDecision::AutoAccept => PlaceStatus::Confirmed,
                    PlaceDecision::NeedsReview => PlaceStatus::PendingReview,
                    PlaceDecision::Reject => {
                        report.clusters_rejected += 1;
                        continue;
                    }
                };
                let id = guard.allocate_place_id()?;
                let place = Place {
                    id,
                    centroid_lat: cluster.centroid.latitude,
                    centroid_lon: cluster.centroid.longitude,
                    radius_m: cluster.radius_m,
                    category: assessment.category,
                    confidence: assessment.confidence,
                    visit_count: 0,
                    total_time_spent_secs: 0,
                    status,
                    user_corrected: false,
                    created_at: job.now,
                };
                guard.upsert_place(&place)?;
                matched.insert(id);
                report.places_created.push(id);
            }
        }
    }

    log::info!(
        "[Detection] Pass {}: {} fixes -> {} clusters, {} new, {} updated, {} rejected",
        generation,
        report.fixes_considered,
        report.clusters_found,
        report.places_created.len(),
        report.places_updated.len(),
        report.clusters_rejected
    );
    Ok(report)
}

/// Closest place whose match radius contains the cluster centroid.
fn nearest_match<'a>(cluster: &Cluster, places: &'a [Place], config: &ClusterConfig) -> Option<&'a Place> {
    places
        .iter()
        .map(|p| (p, haversine_distance(&p.center(), &cluster.centroid)))
        .filter(|(p, d)| *d <= p.radius_m.max(config.eps_m) * config.match_radius_factor)
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(p, _)| p)
}

/// Whether the cluster centroid falls in an area the user rejected, using the
/// same radius rule as place matching.
fn in_rejected_area(cluster: &Cluster, profile: &CategoryProfile, config: &ClusterConfig) -> bool {
    profile
        .rejected_area_containing(&cluster.centroid, config.eps_m, config.match_radius_factor)
        .is_some()
}

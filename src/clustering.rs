//! # Place Clustering
//!
//! Density-based spatial clustering (DBSCAN) of accepted fixes into candidate
//! places. Run as a batch pass, never per fix.
//!
//! - A point is a *core point* if its eps-neighborhood (haversine meters,
//!   including the point itself) holds at least `min_pts` points.
//! - Clusters grow by chaining core points; non-core points reached from a
//!   core point become border points and are never reassigned.
//! - Points are visited in input order, so the result is deterministic for a
//!   fixed input order and `(eps, min_pts)`.
//!
//! Neighborhoods come from an R-tree over the raw coordinates: the envelope
//! query gives candidates, the haversine check decides. The result is
//! identical to the naive O(n²) scan.

use std::collections::VecDeque;

use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::geo_utils::{centroid, haversine_distance, meters_to_degrees, percentile_distance};
use crate::{Fix, GpsPoint, Timestamp};

/// Configuration for the clustering pass and the detection schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Neighborhood radius in meters. Default: 50.0
    pub eps_m: f64,

    /// Minimum neighborhood size (including the point) for a core point.
    /// Default: 3
    pub min_pts: usize,

    /// Percentile of member distances used as the cluster radius.
    /// Default: 95.0 (outlier-resistant, not the raw maximum)
    pub radius_percentile: f64,

    /// Floor for the cluster radius so places always have a positive radius.
    /// Default: 10.0 meters
    pub min_radius_m: f64,

    /// Trigger a detection pass after this many newly accepted fixes.
    /// Default: 50
    pub detection_batch_size: usize,

    /// Only fixes from the last N days take part in detection. Default: 30
    pub detection_window_days: i64,

    /// A cluster matches an existing place when its centroid lies within
    /// `max(place.radius, eps) * match_radius_factor`. Default: 1.0
    pub match_radius_factor: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            eps_m: 50.0,
            min_pts: 3,
            radius_percentile: 95.0,
            min_radius_m: 10.0,
            detection_batch_size: 50,
            detection_window_days: 30,
            match_radius_factor: 1.0,
        }
    }
}

/// A spatial cluster of fixes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Indices into the input slice, ascending
    pub member_indices: Vec<usize>,
    /// Arithmetic mean of member coordinates
    pub centroid: GpsPoint,
    /// Distance to the member at `radius_percentile`, floored at `min_radius_m`
    pub radius_m: f64,
    /// Members per 1,000 m² of the radius circle
    pub density: f64,
    /// Monotone in member count and density, capped at 1.0
    pub confidence: f64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

impl Cluster {
    pub fn member_count(&self) -> usize {
        self.member_indices.len()
    }
}

/// A GPS point with its index for R-tree queries
#[derive(Debug, Clone, Copy)]
struct IndexedPoint {
    idx: usize,
    lat: f64,
    lng: f64,
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lat, self.lng])
    }
}

fn build_rtree(points: &[GpsPoint]) -> RTree<IndexedPoint> {
    let indexed: Vec<IndexedPoint> = points
        .iter()
        .enumerate()
        .map(|(i, p)| IndexedPoint {
            idx: i,
            lat: p.latitude,
            lng: p.longitude,
        })
        .collect();
    RTree::bulk_load(indexed)
}

/// Indices within `eps_m` of `points[i]`, ascending, including `i` itself.
fn neighbors_of(tree: &RTree<IndexedPoint>, points: &[GpsPoint], i: usize, eps_m: f64) -> Vec<usize> {
    let p = &points[i];
    // Slightly widened envelope; the haversine check below is authoritative
    let (dlat, dlng) = meters_to_degrees(eps_m * 1.01, p.latitude);
    let envelope = AABB::from_corners(
        [p.latitude - dlat, p.longitude - dlng],
        [p.latitude + dlat, p.longitude + dlng],
    );

    let mut result: Vec<usize> = tree
        .locate_in_envelope(&envelope)
        .filter(|c| haversine_distance(p, &points[c.idx]) <= eps_m)
        .map(|c| c.idx)
        .collect();
    result.sort_unstable();
    result
}

#[cfg(not(feature = "parallel"))]
fn neighborhoods(points: &[GpsPoint], eps_m: f64) -> Vec<Vec<usize>> {
    let tree = build_rtree(points);
    (0..points.len())
        .map(|i| neighbors_of(&tree, points, i, eps_m))
        .collect()
}

#[cfg(feature = "parallel")]
fn neighborhoods(points: &[GpsPoint], eps_m: f64) -> Vec<Vec<usize>> {
    let tree = build_rtree(points);
    // Indexed parallel iterator collects in input order
    (0..points.len())
        .into_par_iter()
        .map(|i| neighbors_of(&tree, points, i, eps_m))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Unvisited,
    Noise,
    Member(usize),
}

/// Run DBSCAN and return the cluster id for every point (`None` = noise).
pub fn dbscan_labels(points: &[GpsPoint], eps_m: f64, min_pts: usize) -> Vec<Option<usize>> {
    let n = points.len();
    if n == 0 || min_pts == 0 || !(eps_m > 0.0) {
        return vec![None; n];
    }

    let neighbors = neighborhoods(points, eps_m);
    let mut labels = vec![Label::Unvisited; n];
    let mut next_cluster = 0usize;

    for i in 0..n {
        if labels[i] != Label::Unvisited {
            continue;
        }
        if neighbors[i].len() < min_pts {
            labels[i] = Label::Noise;
            continue;
        }

        let cluster_id = next_cluster;
        next_cluster += 1;
        labels[i] = Label::Member(cluster_id);

        let mut queue: VecDeque<usize> = neighbors[i].iter().copied().collect();
        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Label::Noise => {
                    // Border point: claimed, not expanded
                    labels[j] = Label::Member(cluster_id);
                }
                Label::Unvisited => {
                    labels[j] = Label::Member(cluster_id);
                    if neighbors[j].len() >= min_pts {
                        queue.extend(neighbors[j].iter().copied());
                    }
                }
                Label::Member(_) => {}
            }
        }
    }

    labels
        .into_iter()
        .map(|l| match l {
            Label::Member(c) => Some(c),
            _ => None,
        })
        .collect()
}

/// Confidence from member count and density (members per 1,000 m²).
///
/// Non-decreasing in both arguments and capped at 1.0.
pub fn cluster_confidence(member_count: usize, density: f64) -> f64 {
    let n = member_count as f64;
    let count_score = n / (n + 10.0);
    let d = density.max(0.0);
    let density_score = d / (d + 1.0);
    (0.6 * count_score + 0.4 * density_score).clamp(0.0, 1.0)
}

/// Cluster fixes with the given eps (meters) and min_pts, using default
/// radius settings.
pub fn cluster(fixes: &[Fix], eps_m: f64, min_pts: usize) -> Vec<Cluster> {
    let config = ClusterConfig {
        eps_m,
        min_pts,
        ..ClusterConfig::default()
    };
    cluster_with_config(fixes, &config)
}

/// Cluster fixes using the full configuration.
///
/// Fewer fixes than `min_pts` yields an empty result rather than an error.
pub fn cluster_with_config(fixes: &[Fix], config: &ClusterConfig) -> Vec<Cluster> {
    if fixes.len() < config.min_pts.max(1) {
        log::debug!(
            "[Clustering] Not enough fixes ({} < {}), skipping",
            fixes.len(),
            config.min_pts
        );
        return Vec::new();
    }

    let points: Vec<GpsPoint> = fixes.iter().map(|f| f.point()).collect();
    let labels = dbscan_labels(&points, config.eps_m, config.min_pts);

    let cluster_count = labels.iter().flatten().max().map(|m| m + 1).unwrap_or(0);
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    for (idx, label) in labels.iter().enumerate() {
        if let Some(c) = label {
            members[*c].push(idx);
        }
    }

    let clusters: Vec<Cluster> = members
        .into_iter()
        .filter_map(|indices| summarize(fixes, &points, indices, config))
        .collect();

    log::debug!(
        "[Clustering] {} fixes -> {} clusters (eps={}m, min_pts={})",
        fixes.len(),
        clusters.len(),
        config.eps_m,
        config.min_pts
    );
    clusters
}

fn summarize(fixes: &[Fix], points: &[GpsPoint], indices: Vec<usize>, config: &ClusterConfig) -> Option<Cluster> {
    let member_points: Vec<GpsPoint> = indices.iter().map(|&i| points[i]).collect();
    let center = centroid(&member_points)?;
    let radius = percentile_distance(&center, &member_points, config.radius_percentile)
        .max(config.min_radius_m)
        .max(f64::EPSILON);

    let area_m2 = std::f64::consts::PI * radius * radius;
    let density = member_points.len() as f64 / area_m2 * 1000.0;

    let first_seen = indices.iter().map(|&i| fixes[i].timestamp).min()?;
    let last_seen = indices.iter().map(|&i| fixes[i].timestamp).max()?;

    Some(Cluster {
        confidence: cluster_confidence(indices.len(), density),
        member_indices: indices,
        centroid: center,
        radius_m: radius,
        density,
        first_seen,
        last_seen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_point;

    fn home() -> GpsPoint {
        GpsPoint::new(47.3769, 8.5417)
    }

    fn fix_near(center: &GpsPoint, north: f64, east: f64, ts: Timestamp) -> Fix {
        let p = offset_point(center, north, east);
        Fix::new(p.latitude, p.longitude, 10.0, ts)
    }

    fn ring(center: &GpsPoint, count: usize, radius_m: f64, start_ts: Timestamp) -> Vec<Fix> {
        (0..count)
            .map(|i| {
                let angle = i as f64 / count as f64 * std::f64::consts::TAU;
                fix_near(center, radius_m * angle.sin(), radius_m * angle.cos(), start_ts + i as i64 * 60)
            })
            .collect()
    }

    #[test]
    fn test_single_dense_cluster() {
        let fixes = ring(&home(), 12, 20.0, 0);
        let clusters = cluster(&fixes, 50.0, 3);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_count(), 12);
        assert!(clusters[0].confidence > 0.0);
        assert!(haversine_distance(&clusters[0].centroid, &home()) < 2.0);
    }

    #[test]
    fn test_sparse_points_are_noise() {
        let fixes = vec![
            fix_near(&home(), 0.0, 0.0, 0),
            fix_near(&home(), 500.0, 0.0, 60),
            fix_near(&home(), 1000.0, 0.0, 120),
        ];
        assert!(cluster(&fixes, 50.0, 3).is_empty());
    }

    #[test]
    fn test_too_few_fixes_returns_empty() {
        let fixes = vec![fix_near(&home(), 0.0, 0.0, 0)];
        assert!(cluster(&fixes, 50.0, 3).is_empty());
    }

    #[test]
    fn test_two_separate_clusters_in_order() {
        let work = offset_point(&home(), 3000.0, 0.0);
        let mut fixes = ring(&home(), 8, 10.0, 0);
        fixes.extend(ring(&work, 6, 10.0, 10_000));

        let clusters = cluster(&fixes, 50.0, 3);
        assert_eq!(clusters.len(), 2);
        // First cluster follows input order
        assert_eq!(clusters[0].member_indices, (0..8).collect::<Vec<_>>());
        assert_eq!(clusters[1].member_count(), 6);
        assert_eq!(clusters[1].first_seen, 10_000);
    }

    #[test]
    fn test_deterministic_labels() {
        let mut fixes = ring(&home(), 10, 25.0, 0);
        fixes.push(fix_near(&home(), 60.0, 0.0, 2000));
        fixes.push(fix_near(&home(), 800.0, 0.0, 3000));
        let points: Vec<GpsPoint> = fixes.iter().map(|f| f.point()).collect();

        let a = dbscan_labels(&points, 50.0, 3);
        let b = dbscan_labels(&points, 50.0, 3);
        assert_eq!(a, b);
        assert_eq!(a[11], None);
    }

    #[test]
    fn test_border_point_not_reassigned() {
        // Two tight groups on a line with a non-core point between them,
        // within eps of the nearest member of each group
        let a = home();
        let mut fixes: Vec<Fix> = (0..4).map(|i| fix_near(&a, i as f64, 0.0, i * 60)).collect();
        fixes.push(fix_near(&a, 48.5, 0.0, 500));
        fixes.extend((0..4).map(|i| fix_near(&a, 94.0 + i as f64, 0.0, 1000 + i * 60)));

        let points: Vec<GpsPoint> = fixes.iter().map(|f| f.point()).collect();
        let labels = dbscan_labels(&points, 46.0, 4);
        // The border point belongs to the first cluster that reached it
        assert_eq!(labels[4], labels[0]);
        assert_ne!(labels[0], labels[5]);
    }

    #[test]
    fn test_radius_resists_outlier() {
        let mut fixes = ring(&home(), 20, 15.0, 0);
        // Chained outlier: still in the cluster via a neighbor, but far out
        fixes.push(fix_near(&home(), 55.0, 0.0, 5000));
        let clusters = cluster(&fixes, 50.0, 3);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].radius_m < 30.0, "radius {}", clusters[0].radius_m);
    }

    #[test]
    fn test_confidence_monotone() {
        let mut prev = 0.0;
        for n in 1..50 {
            let c = cluster_confidence(n, 0.5);
            assert!(c >= prev);
            prev = c;
        }
        let mut prev = 0.0;
        for d in 0..50 {
            let c = cluster_confidence(10, d as f64 * 0.2);
            assert!(c >= prev);
            prev = c;
        }
        assert!(cluster_confidence(usize::MAX / 2, 1e12) <= 1.0);
    }
}

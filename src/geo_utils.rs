//! # Geographic Utilities
//!
//! Geographic computations shared by the filter, the clustering pass and the
//! proximity detector.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//! | [`centroid`] | Arithmetic mean of a set of points |
//! | [`percentile_distance`] | Nearest-rank percentile of distances from a center |
//!
//! All functions expect WGS84 coordinates in degrees. Distances are always
//! computed on the sphere, never as planar Euclidean distance on raw degrees.

use geo::{Distance, Haversine, Point};

use crate::GpsPoint;

/// Meters per degree of latitude (mean).
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Great-circle distance in meters between two GPS points.
///
/// ```rust
/// use place_tracker::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0);
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Convert a distance in meters into `(lat_degrees, lng_degrees)` spans at the
/// given latitude.
///
/// The longitude span grows toward the poles; it is clamped so that the
/// cosine never drops below 0.01 (about 89.4°).
pub fn meters_to_degrees(meters: f64, latitude: f64) -> (f64, f64) {
    let lat_deg = meters / METERS_PER_DEGREE;
    let cos_lat = latitude.to_radians().cos().abs().max(0.01);
    let lng_deg = meters / (METERS_PER_DEGREE * cos_lat);
    (lat_deg, lng_deg)
}

/// Arithmetic mean of the points (not the medoid).
///
/// Returns `None` for an empty slice.
pub fn centroid(points: &[GpsPoint]) -> Option<GpsPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sum_lat, sum_lng) = points.iter().fold((0.0, 0.0), |(lat, lng), p| {
        (lat + p.latitude, lng + p.longitude)
    });
    Some(GpsPoint::new(sum_lat / n, sum_lng / n))
}

/// Distance from `center` to the member at the given percentile (0-100) of
/// sorted distances, using the nearest-rank method.
///
/// Returns 0.0 for an empty slice.
pub fn percentile_distance(center: &GpsPoint, points: &[GpsPoint], percentile: f64) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let mut distances: Vec<f64> = points
        .iter()
        .map(|p| haversine_distance(center, p))
        .collect();
    distances.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let pct = percentile.clamp(0.0, 100.0);
    let rank = ((pct / 100.0) * distances.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(distances.len() - 1);
    distances[idx]
}

/// Offset a point by the given meters north and east. Used by tests and
/// synthetic data generators.
pub fn offset_point(origin: &GpsPoint, north_m: f64, east_m: f64) -> GpsPoint {
    let (lat_per_m, lng_per_m) = meters_to_degrees(1.0, origin.latitude);
    GpsPoint::new(
        origin.latitude + north_m * lat_per_m,
        origin.longitude + east_m * lng_per_m,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_short_distance() {
        let a = GpsPoint::new(51.5074, -0.1278);
        let b = offset_point(&a, 100.0, 0.0);
        let d = haversine_distance(&a, &b);
        assert!((d - 100.0).abs() < 1.0, "expected ~100m, got {}", d);
    }

    #[test]
    fn test_centroid_is_mean() {
        let points = vec![
            GpsPoint::new(10.0, 20.0),
            GpsPoint::new(12.0, 22.0),
            GpsPoint::new(14.0, 24.0),
        ];
        let c = centroid(&points).unwrap();
        assert!((c.latitude - 12.0).abs() < 1e-12);
        assert!((c.longitude - 22.0).abs() < 1e-12);
        assert!(centroid(&[]).is_none());
    }

    #[test]
    fn test_percentile_ignores_outlier() {
        let center = GpsPoint::new(51.5, -0.12);
        let mut points: Vec<GpsPoint> = (0..19)
            .map(|i| offset_point(&center, i as f64, 0.0))
            .collect();
        points.push(offset_point(&center, 5000.0, 0.0));

        let p95 = percentile_distance(&center, &points, 95.0);
        let p100 = percentile_distance(&center, &points, 100.0);
        assert!(p95 < 20.0, "95th percentile should skip the outlier: {}", p95);
        assert!(p100 > 4900.0);
    }

    #[test]
    fn test_meters_to_degrees_widens_longitude() {
        let (lat_eq, lng_eq) = meters_to_degrees(1000.0, 0.0);
        let (lat_hi, lng_hi) = meters_to_degrees(1000.0, 60.0);
        assert!((lat_eq - lat_hi).abs() < 1e-12);
        assert!(lng_hi > lng_eq * 1.9);
    }
}

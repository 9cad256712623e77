//! # Location Filter
//!
//! Per-fix accept/reject decision applied synchronously at ingestion.
//!
//! The decision is a pure function of `(fix, filter state, config)`; the
//! updated state is returned alongside the decision instead of being mutated
//! behind the caller's back. Cutoffs are applied in order and each one is
//! sufficient to reject:
//!
//! 1. accuracy worse than the (relaxed) accuracy threshold
//! 2. movement since the last accepted fix below the mode-dependent threshold
//! 3. implausible speed for the elapsed time and distance
//! 4. arrival faster than the minimum sampling interval
//!
//! Thresholds relax multiplicatively with the time since the last accepted
//! fix, up to `relax_ceiling`. Once the ceiling is reached the movement cutoff
//! is waived, so a device sitting still keeps producing a fix every few minutes.

use serde::{Deserialize, Serialize};

use crate::geo_utils::haversine_distance;
use crate::{Fix, Timestamp};

/// Configuration for the location filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Reject fixes whose reported accuracy radius is worse than this.
    /// Default: 50.0 meters
    pub accuracy_threshold_m: f64,

    /// Minimum movement to accept a fix while moving.
    /// Default: 15.0 meters
    pub moving_threshold_m: f64,

    /// Minimum movement to accept a fix while stationary (hysteresis band).
    /// Default: 50.0 meters
    pub stationary_threshold_m: f64,

    /// Enter stationary mode after this long without qualifying movement.
    /// Default: 300 seconds
    pub stationary_after_secs: i64,

    /// Reject fixes implying a speed above this.
    /// Default: 70.0 m/s (~250 km/h)
    pub speed_ceiling_mps: f64,

    /// Minimum time between accepted fixes.
    /// Default: 5 seconds
    pub min_interval_secs: i64,

    /// Each full interval of this length without an accepted fix relaxes the
    /// thresholds by `relax_factor`. Default: 60 seconds
    pub relax_after_secs: i64,

    /// Multiplicative relaxation per interval. Default: 1.5
    pub relax_factor: f64,

    /// Hard cap on the relaxation multiplier. Default: 4.0
    pub relax_ceiling: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: 50.0,
            moving_threshold_m: 15.0,
            stationary_threshold_m: 50.0,
            stationary_after_secs: 300,
            speed_ceiling_mps: 70.0,
            min_interval_secs: 5,
            relax_after_secs: 60,
            relax_factor: 1.5,
            relax_ceiling: 4.0,
        }
    }
}

/// Whether the device is currently considered to be moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MotionMode {
    #[default]
    Moving,
    Stationary,
}

/// Why a fix was rejected. Rejection is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Non-finite or out-of-range coordinates, or negative accuracy
    InvalidCoordinates,
    PoorAccuracy { accuracy_m: f64, threshold_m: f64 },
    InsufficientMovement { distance_m: f64, threshold_m: f64 },
    ImplausibleSpeed { speed_mps: f64, ceiling_mps: f64 },
    TooFrequent { elapsed_secs: i64, min_interval_secs: i64 },
}

/// Outcome of filtering a single fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterDecision {
    Accept,
    Reject(RejectReason),
}

impl FilterDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, FilterDecision::Accept)
    }
}

/// State carried between filter decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    /// Last fix that passed the filter
    pub last_accepted: Option<Fix>,
    /// Current motion mode
    pub mode: MotionMode,
    /// Time of the last qualifying movement
    pub last_movement_time: Option<Timestamp>,
    pub accepted_count: u64,
    pub rejected_count: u64,
}

impl FilterState {
    /// Relaxation multiplier at time `at`, in `[1.0, relax_ceiling]`.
    pub fn relax_multiplier(&self, at: Timestamp, config: &FilterConfig) -> f64 {
        let Some(last) = &self.last_accepted else {
            return 1.0;
        };
        let elapsed = at - last.timestamp;
        if elapsed <= 0 || config.relax_after_secs <= 0 {
            return 1.0;
        }
        let steps = (elapsed / config.relax_after_secs).min(i32::MAX as i64) as i32;
        config
            .relax_factor
            .max(1.0)
            .powi(steps)
            .min(config.relax_ceiling.max(1.0))
    }

    /// Mode in effect at time `at`: stationary once no qualifying movement
    /// has happened for `stationary_after_secs`.
    fn mode_at(&self, at: Timestamp, config: &FilterConfig) -> MotionMode {
        match (self.mode, self.last_movement_time) {
            (MotionMode::Moving, Some(t)) if at - t >= config.stationary_after_secs => {
                MotionMode::Stationary
            }
            (mode, _) => mode,
        }
    }
}

/// Decide whether to accept `fix`. Pure: identical inputs give identical
/// outputs.
pub fn accept(fix: &Fix, state: &FilterState, config: &FilterConfig) -> (FilterDecision, FilterState) {
    let mut next = state.clone();
    next.mode = state.mode_at(fix.timestamp, config);

    let reject = |mut next: FilterState, reason: RejectReason| {
        next.rejected_count += 1;
        (FilterDecision::Reject(reason), next)
    };

    if !fix.is_valid() {
        return reject(next, RejectReason::InvalidCoordinates);
    }

    let multiplier = state.relax_multiplier(fix.timestamp, config);

    // 1. Accuracy
    let accuracy_threshold = config.accuracy_threshold_m * multiplier;
    if fix.accuracy_m > accuracy_threshold {
        return reject(
            next,
            RejectReason::PoorAccuracy {
                accuracy_m: fix.accuracy_m,
                threshold_m: accuracy_threshold,
            },
        );
    }

    let Some(last) = &state.last_accepted else {
        next.last_accepted = Some(fix.clone());
        next.last_movement_time = Some(fix.timestamp);
        next.mode = MotionMode::Moving;
        next.accepted_count += 1;
        return (FilterDecision::Accept, next);
    };

    // 2. Movement (hysteresis: larger threshold while stationary)
    let distance = haversine_distance(&last.point(), &fix.point());
    let base_threshold = match next.mode {
        MotionMode::Moving => config.moving_threshold_m,
        MotionMode::Stationary => config.stationary_threshold_m,
    };
    let movement_threshold = base_threshold / multiplier;
    let qualifying_movement = distance >= movement_threshold;
    let keep_alive = multiplier >= config.relax_ceiling;
    if !qualifying_movement && !keep_alive {
        return reject(
            next,
            RejectReason::InsufficientMovement {
                distance_m: distance,
                threshold_m: movement_threshold,
            },
        );
    }

    // 3. Speed
    let elapsed = fix.timestamp - last.timestamp;
    if elapsed > 0 {
        let speed = distance / elapsed as f64;
        if speed > config.speed_ceiling_mps {
            return reject(
                next,
                RejectReason::ImplausibleSpeed {
                    speed_mps: speed,
                    ceiling_mps: config.speed_ceiling_mps,
                },
            );
        }
    }
    if let Some(reported) = fix.speed_mps {
        if reported > config.speed_ceiling_mps {
            return reject(
                next,
                RejectReason::ImplausibleSpeed {
                    speed_mps: reported,
                    ceiling_mps: config.speed_ceiling_mps,
                },
            );
        }
    }

    // 4. Sampling interval (also catches out-of-order arrivals)
    if elapsed < config.min_interval_secs {
        return reject(
            next,
            RejectReason::TooFrequent {
                elapsed_secs: elapsed,
                min_interval_secs: config.min_interval_secs,
            },
        );
    }

    if qualifying_movement {
        next.mode = MotionMode::Moving;
        next.last_movement_time = Some(fix.timestamp);
    }
    next.last_accepted = Some(fix.clone());
    next.accepted_count += 1;
    (FilterDecision::Accept, next)
}

/// Convenience wrapper owning config and state.
#[derive(Debug, Clone, Default)]
pub struct LocationFilter {
    config: FilterConfig,
    state: FilterState,
}

impl LocationFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            state: FilterState::default(),
        }
    }

    /// Decide on a fix without advancing the state. Pass the returned state
    /// to [`commit`](Self::commit) once the fix has been handled.
    pub fn evaluate(&self, fix: &Fix) -> (FilterDecision, FilterState) {
        let (decision, next) = accept(fix, &self.state, &self.config);
        if let FilterDecision::Reject(reason) = &decision {
            log::debug!("[LocationFilter] Rejected fix at {}: {:?}", fix.timestamp, reason);
        }
        (decision, next)
    }

    pub fn commit(&mut self, next: FilterState) {
        self.state = next;
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::offset_point;
    use crate::GpsPoint;

    fn origin() -> GpsPoint {
        GpsPoint::new(51.5074, -0.1278)
    }

    fn fix_at(north_m: f64, accuracy: f64, ts: Timestamp) -> Fix {
        let p = offset_point(&origin(), north_m, 0.0);
        Fix::new(p.latitude, p.longitude, accuracy, ts)
    }

    #[test]
    fn test_first_fix_accepted() {
        let (decision, state) = accept(&fix_at(0.0, 10.0, 1000), &FilterState::default(), &FilterConfig::default());
        assert_eq!(decision, FilterDecision::Accept);
        assert_eq!(state.accepted_count, 1);
        assert!(state.last_accepted.is_some());
    }

    #[test]
    fn test_pure_decision() {
        let config = FilterConfig::default();
        let (_, state) = accept(&fix_at(0.0, 10.0, 1000), &FilterState::default(), &config);
        let fix = fix_at(30.0, 10.0, 1020);

        let a = accept(&fix, &state, &config);
        let b = accept(&fix, &state, &config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_poor_accuracy() {
        let (decision, state) = accept(&fix_at(0.0, 120.0, 1000), &FilterState::default(), &FilterConfig::default());
        assert!(matches!(
            decision,
            FilterDecision::Reject(RejectReason::PoorAccuracy { .. })
        ));
        assert_eq!(state.rejected_count, 1);
    }

    #[test]
    fn test_rejects_invalid_coordinates() {
        let fix = Fix::new(f64::NAN, 0.0, 5.0, 1000);
        let (decision, _) = accept(&fix, &FilterState::default(), &FilterConfig::default());
        assert_eq!(decision, FilterDecision::Reject(RejectReason::InvalidCoordinates));
    }

    #[test]
    fn test_rejects_small_movement() {
        let config = FilterConfig::default();
        let (_, state) = accept(&fix_at(0.0, 10.0, 1000), &FilterState::default(), &config);
        let (decision, _) = accept(&fix_at(5.0, 10.0, 1010), &state, &config);
        assert!(matches!(
            decision,
            FilterDecision::Reject(RejectReason::InsufficientMovement { .. })
        ));
    }

    #[test]
    fn test_rejects_implausible_speed() {
        let config = FilterConfig::default();
        let (_, state) = accept(&fix_at(0.0, 10.0, 1000), &FilterState::default(), &config);
        // 5km in 10 seconds
        let (decision, _) = accept(&fix_at(5000.0, 10.0, 1010), &state, &config);
        assert!(matches!(
            decision,
            FilterDecision::Reject(RejectReason::ImplausibleSpeed { .. })
        ));
    }

    #[test]
    fn test_rejects_too_frequent() {
        let config = FilterConfig::default();
        let (_, state) = accept(&fix_at(0.0, 10.0, 1000), &FilterState::default(), &config);
        let (decision, _) = accept(&fix_at(40.0, 10.0, 1002), &state, &config);
        assert!(matches!(
            decision,
            FilterDecision::Reject(RejectReason::TooFrequent { .. })
        ));
    }

    #[test]
    fn test_out_of_order_fix_rejected() {
        let config = FilterConfig::default();
        let (_, state) = accept(&fix_at(0.0, 10.0, 1000), &FilterState::default(), &config);
        let (decision, _) = accept(&fix_at(40.0, 10.0, 900), &state, &config);
        assert!(!decision.is_accept());
    }

    #[test]
    fn test_stationary_hysteresis() {
        let config = FilterConfig::default();
        let (_, mut state) = accept(&fix_at(0.0, 10.0, 0), &FilterState::default(), &config);
        assert_eq!(state.mode, MotionMode::Moving);

        // Small jitter for longer than stationary_after_secs
        for i in 1..=6 {
            let (_, next) = accept(&fix_at(3.0, 10.0, i * 55), &state, &config);
            state = next;
        }
        assert_eq!(state.mode, MotionMode::Stationary);

        // One qualifying movement exits stationary mode
        let (decision, next) = accept(&fix_at(400.0, 10.0, 400), &state, &config);
        assert_eq!(decision, FilterDecision::Accept);
        assert_eq!(next.mode, MotionMode::Moving);
    }

    #[test]
    fn test_relaxation_is_capped() {
        let config = FilterConfig::default();
        let (_, state) = accept(&fix_at(0.0, 10.0, 0), &FilterState::default(), &config);

        assert_eq!(state.relax_multiplier(30, &config), 1.0);
        assert!((state.relax_multiplier(60, &config) - 1.5).abs() < 1e-9);
        assert_eq!(state.relax_multiplier(100_000, &config), config.relax_ceiling);

        // Relaxed accuracy allows 150m after a long gap but never beyond the ceiling
        let (decision, _) = accept(&fix_at(500.0, 150.0, 10_000), &state, &config);
        assert_eq!(decision, FilterDecision::Accept);
        let (decision, _) = accept(&fix_at(500.0, 250.0, 10_000), &state, &config);
        assert!(matches!(
            decision,
            FilterDecision::Reject(RejectReason::PoorAccuracy { .. })
        ));
    }

    #[test]
    fn test_keep_alive_accepts_stationary_device() {
        let config = FilterConfig::default();
        let mut filter = LocationFilter::new(config);
        let mut accepted = 0;
        // One hour sitting still, a fix every 30 seconds
        for i in 0..120 {
            let (decision, next) = filter.evaluate(&fix_at(1.0, 10.0, i * 30));
            filter.commit(next);
            if decision.is_accept() {
                accepted += 1;
            }
        }
        assert!(accepted > 5, "expected periodic keep-alive fixes, got {}", accepted);
        assert!(accepted < 40);
    }

    #[test]
    fn test_evaluate_leaves_state_until_commit() {
        let mut filter = LocationFilter::new(FilterConfig::default());
        let fix = fix_at(0.0, 10.0, 1000);

        let (decision, next) = filter.evaluate(&fix);
        assert_eq!(decision, FilterDecision::Accept);
        assert!(filter.state().last_accepted.is_none());

        // Not committed: the same fix is still accepted
        let (again, _) = filter.evaluate(&fix);
        assert_eq!(again, FilterDecision::Accept);

        filter.commit(next);
        assert_eq!(filter.state().accepted_count, 1);
        assert!(!filter.evaluate(&fix).0.is_accept());
    }
}

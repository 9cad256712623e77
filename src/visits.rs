//! # Visit State Machine
//!
//! Converts enter/exit boundary events into [`Visit`] records.
//!
//! ```text
//! NO_VISIT --enter(p)--> ACTIVE --exit(p)--> CLOSING --> CLOSED
//!                          |
//!                          +--enter(q)--> implicit exit of p at enter time,
//!                                         then ACTIVE on q
//! ```
//!
//! The tracker is the only writer of [`CurrentState`]. It owns the write side
//! of the state cell and hands out [`CurrentStateReader`]s. Callers share the
//! tracker behind a single mutex, which is the one serialization point for
//! every enter/exit regardless of its source (geofence callback or
//! proximity detection).
//!
//! Stale input is ignored and counted, never an error:
//! - enter/exit for a place that does not exist
//! - exit without a matching ACTIVE visit
//! - exit (or implicit exit) at or before the visit's entry time
//! - enter older than the last resolved boundary
//!
//! Persistence failures propagate. A failed close leaves the visit ACTIVE
//! and the in-memory state untouched.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{PlaceTrackerError, Result};
use crate::store::{lock_store, PlaceStore, SharedStore};
use crate::{Category, CurrentState, PlaceId, Timestamp, Visit};

/// Configuration for visit tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisitConfig {
    /// Force-close visits left ACTIVE longer than this. Default: 24 hours
    pub reconciliation_cap_hours: i64,

    /// Proximity exit fires beyond `radius * proximity_exit_factor`.
    /// Default: 1.5
    pub proximity_exit_factor: f64,

    /// Capacity of the bounded platform event queue. Default: 256
    pub event_queue_capacity: usize,

    /// Minimum time between reconciliation sweeps run from fix ingestion,
    /// measured in fix time. 0 leaves sweeps to the caller. Default: 60 minutes
    pub sweep_interval_mins: i64,
}

impl Default for VisitConfig {
    fn default() -> Self {
        Self {
            reconciliation_cap_hours: 24,
            proximity_exit_factor: 1.5,
            event_queue_capacity: 256,
            sweep_interval_mins: 60,
        }
    }
}

impl VisitConfig {
    pub fn reconciliation_cap_secs(&self) -> i64 {
        self.reconciliation_cap_hours * 3600
    }

    pub fn sweep_interval_secs(&self) -> i64 {
        self.sweep_interval_mins * 60
    }
}

// ============================================================================
// Platform events
// ============================================================================

/// Where a boundary event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    #[default]
    Geofence,
    Proximity,
}

/// An enter or exit crossing for a place boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryEvent {
    pub place_id: PlaceId,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub source: EventSource,
}

impl BoundaryEvent {
    pub fn new(place_id: PlaceId, timestamp: Timestamp, source: EventSource) -> Self {
        Self {
            place_id,
            timestamp,
            source,
        }
    }
}

/// A user correction of a place's category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEvent {
    pub place_id: PlaceId,
    pub category: Category,
}

/// Typed event payloads accepted at the ingestion boundary.
///
/// JSON form: `{"type": "enter", "place_id": 7, "timestamp": 1700000000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlatformEvent {
    Enter(BoundaryEvent),
    Exit(BoundaryEvent),
    Correction(CorrectionEvent),
}

impl PlatformEvent {
    pub fn enter(place_id: PlaceId, timestamp: Timestamp) -> Self {
        PlatformEvent::Enter(BoundaryEvent::new(place_id, timestamp, EventSource::Geofence))
    }

    pub fn exit(place_id: PlaceId, timestamp: Timestamp) -> Self {
        PlatformEvent::Exit(BoundaryEvent::new(place_id, timestamp, EventSource::Geofence))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Outcomes and diagnostics
// ============================================================================

/// Phase of the tracker's current visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerPhase {
    NoVisit,
    Active,
    /// Close write in progress
    Closing,
    /// Last visit closed, none active
    Closed,
}

/// Why an event was ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaleReason {
    UnknownPlace,
    NoActiveVisit,
    PlaceMismatch { active_place_id: PlaceId },
    AtOrBeforeEntry,
    BeforeLastTransition,
}

/// Result of applying a boundary event.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Opened(Visit),
    Closed(Visit),
    /// Implicit exit of `closed` followed by opening `opened`
    Switched { closed: Visit, opened: Visit },
    /// Enter for the place that is already ACTIVE
    Duplicate,
    Ignored(StaleReason),
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerDiagnostics {
    pub opened: u64,
    pub closed: u64,
    pub implicit_exits: u64,
    pub duplicate_enters: u64,
    pub stale_events: u64,
    pub reconciled_visits: u64,
}

// ============================================================================
// CurrentState handles
// ============================================================================

/// Read-only handle to the [`CurrentState`] cell.
#[derive(Debug, Clone)]
pub struct CurrentStateReader(Arc<RwLock<CurrentState>>);

impl CurrentStateReader {
    pub fn snapshot(&self) -> CurrentState {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Exclusive write handle, held only by the tracker.
#[derive(Debug)]
struct CurrentStateWriter(Arc<RwLock<CurrentState>>);

impl CurrentStateWriter {
    fn new(state: CurrentState) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    fn reader(&self) -> CurrentStateReader {
        CurrentStateReader(Arc::clone(&self.0))
    }

    fn snapshot(&self) -> CurrentState {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set(&self, state: CurrentState) {
        match self.0.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

// ============================================================================
// Visit tracker
// ============================================================================

/// Single-writer visit state machine.
pub struct VisitTracker<S: PlaceStore> {
    store: SharedStore<S>,
    state: CurrentStateWriter,
    phase: TrackerPhase,
    config: VisitConfig,
    diagnostics: TrackerDiagnostics,
}

impl<S: PlaceStore> VisitTracker<S> {
    /// Create a tracker, restoring CurrentState from the store and
    /// reconciling it against the persisted open visits.
    pub fn new(store: SharedStore<S>, config: VisitConfig) -> Result<Self> {
        let persisted = lock_store(&store)?.load_current_state()?;
        let phase = if persisted.current_visit_id.is_some() {
            TrackerPhase::Active
        } else {
            TrackerPhase::NoVisit
        };
        let mut tracker = Self {
            store,
            state: CurrentStateWriter::new(persisted),
            phase,
            config,
            diagnostics: TrackerDiagnostics::default(),
        };
        tracker.reconcile_on_startup()?;
        Ok(tracker)
    }

    pub fn reader(&self) -> CurrentStateReader {
        self.state.reader()
    }

    pub fn current_state(&self) -> CurrentState {
        self.state.snapshot()
    }

    pub fn phase(&self) -> TrackerPhase {
        self.phase
    }

    pub fn diagnostics(&self) -> TrackerDiagnostics {
        self.diagnostics
    }

    pub fn config(&self) -> &VisitConfig {
        &self.config
    }

    /// Apply an enter or exit event.
    pub fn apply(&mut self, event: &PlatformEvent) -> Result<TransitionOutcome> {
        match event {
            PlatformEvent::Enter(e) => self.enter(e),
            PlatformEvent::Exit(e) => self.exit(e),
            PlatformEvent::Correction(c) => Err(PlaceTrackerError::Internal {
                message: format!("correction for place {} is not a boundary event", c.place_id),
            }),
        }
    }

    /// Handle an enter event.
    pub fn enter(&mut self, event: &BoundaryEvent) -> Result<TransitionOutcome> {
        let store_handle = Arc::clone(&self.store);
        let mut store = lock_store(&store_handle)?;
        let state = self.state.snapshot();
        let ts = event.timestamp;

        if store.get_place(event.place_id)?.is_none() {
            return Ok(self.stale(event, StaleReason::UnknownPlace));
        }

        let current = match state.current_visit_id {
            Some(id) => store.get_visit(id)?.filter(|v| v.is_open()),
            None => None,
        };

        if let Some(current) = &current {
            if current.place_id == event.place_id {
                self.diagnostics.duplicate_enters += 1;
                log::debug!(
                    "[VisitTracker] Duplicate enter for place {} ({:?})",
                    event.place_id,
                    event.source
                );
                return Ok(TransitionOutcome::Duplicate);
            }
        }

        if state.last_transition_time.is_some_and(|last| ts < last) {
            return Ok(self.stale(event, StaleReason::BeforeLastTransition));
        }

        match current {
            Some(current) => {
                if ts <= current.entry_time {
                    return Ok(self.stale(event, StaleReason::AtOrBeforeEntry));
                }
                let closed = self.close(&mut *store, &current, ts, false)?;
                self.diagnostics.implicit_exits += 1;
                log::info!(
                    "[VisitTracker] Implicit exit of place {} at {} (enter {})",
                    current.place_id,
                    ts,
                    event.place_id
                );
                let opened = self.open(&mut *store, event.place_id, ts)?;
                Ok(TransitionOutcome::Switched { closed, opened })
            }
            None => {
                let opened = self.open(&mut *store, event.place_id, ts)?;
                Ok(TransitionOutcome::Opened(opened))
            }
        }
    }

    /// Handle an exit event.
    pub fn exit(&mut self, event: &BoundaryEvent) -> Result<TransitionOutcome> {
        let store_handle = Arc::clone(&self.store);
        let mut store = lock_store(&store_handle)?;
        let state = self.state.snapshot();

        let current = match state.current_visit_id {
            Some(id) => store.get_visit(id)?.filter(|v| v.is_open()),
            None => None,
        };

        let Some(current) = current else {
            return Ok(self.stale(event, StaleReason::NoActiveVisit));
        };
        if current.place_id != event.place_id {
            return Ok(self.stale(
                event,
                StaleReason::PlaceMismatch {
                    active_place_id: current.place_id,
                },
            ));
        }
        if event.timestamp <= current.entry_time {
            return Ok(self.stale(event, StaleReason::AtOrBeforeEntry));
        }

        let closed = self.close(&mut *store, &current, event.timestamp, false)?;
        Ok(TransitionOutcome::Closed(closed))
    }

    /// Record the time of an accepted fix.
    pub fn note_fix(&mut self, timestamp: Timestamp) -> Result<()> {
        let mut next = self.state.snapshot();
        if next.last_fix_time.is_some_and(|t| t >= timestamp) {
            return Ok(());
        }
        next.last_fix_time = Some(timestamp);
        self.state.set(next.clone());
        lock_store(&self.store)?.save_current_state(&next)
    }

    /// Reconcile CurrentState against persisted visits after a restart.
    ///
    /// Clears pointers to visits that are missing or already closed, and
    /// force-closes open visits that CurrentState does not reference.
    pub fn reconcile_on_startup(&mut self) -> Result<Vec<Visit>> {
        let store_handle = Arc::clone(&self.store);
        let mut store = lock_store(&store_handle)?;
        let mut state = self.state.snapshot();
        let open = store.open_visits()?;

        let current = state
            .current_visit_id
            .and_then(|id| open.iter().find(|v| v.id == id))
            .cloned();
        match &current {
            Some(v) => {
                state.current_place_id = Some(v.place_id);
                self.phase = TrackerPhase::Active;
            }
            None => {
                if state.current_visit_id.is_some() {
                    log::warn!(
                        "[VisitTracker] Clearing stale current visit {:?}",
                        state.current_visit_id
                    );
                }
                state.current_place_id = None;
                state.current_visit_id = None;
                self.phase = TrackerPhase::NoVisit;
            }
        }

        let mut reconciled = Vec::new();
        for orphan in open.iter().filter(|v| Some(v.id) != state.current_visit_id) {
            let exit = forced_exit_time(orphan, state.last_fix_time);
            let mut closed = orphan.closed_at(exit);
            closed.reconciled = true;
            store.close_visit(&closed)?;
            self.diagnostics.reconciled_visits += 1;
            log::warn!(
                "[VisitTracker] Reconciled orphan visit {} at place {} (exit {})",
                closed.id,
                closed.place_id,
                exit
            );
            reconciled.push(closed);
        }

        self.state.set(state.clone());
        store.save_current_state(&state)?;
        Ok(reconciled)
    }

    /// Force-close visits left ACTIVE longer than the configured cap.
    ///
    /// The exit time is the last known fix time, never `now`. If no fix
    /// arrived after the entry, the visit closes one second after entry.
    pub fn reconciliation_sweep(&mut self, now: Timestamp) -> Result<Vec<Visit>> {
        let store_handle = Arc::clone(&self.store);
        let mut store = lock_store(&store_handle)?;
        let cap = self.config.reconciliation_cap_secs();
        let state = self.state.snapshot();

        let mut reconciled = Vec::new();
        for visit in store.open_visits()? {
            if now - visit.entry_time <= cap {
                continue;
            }
            let exit = forced_exit_time(&visit, state.last_fix_time);
            if state.current_visit_id == Some(visit.id) {
                let closed = self.close(&mut *store, &visit, exit, true)?;
                reconciled.push(closed);
            } else {
                let mut closed = visit.closed_at(exit);
                closed.reconciled = true;
                store.close_visit(&closed)?;
                reconciled.push(closed);
            }
            self.diagnostics.reconciled_visits += 1;
            log::warn!(
                "[VisitTracker] Forced close of visit {} after {}h cap (exit {})",
                visit.id,
                self.config.reconciliation_cap_hours,
                exit
            );
        }
        Ok(reconciled)
    }

    /// Drop CurrentState pointers to a place that is being deleted.
    pub fn forget_place(&mut self, place_id: PlaceId) -> Result<()> {
        let mut state = self.state.snapshot();
        if state.current_place_id != Some(place_id) {
            return Ok(());
        }
        state.current_place_id = None;
        state.current_visit_id = None;
        self.state.set(state.clone());
        self.phase = TrackerPhase::NoVisit;
        lock_store(&self.store)?.save_current_state(&state)
    }

    fn stale(&mut self, event: &BoundaryEvent, reason: StaleReason) -> TransitionOutcome {
        self.diagnostics.stale_events += 1;
        log::warn!(
            "[VisitTracker] Ignoring stale event for place {} at {} ({:?}): {:?}",
            event.place_id,
            event.timestamp,
            event.source,
            reason
        );
        TransitionOutcome::Ignored(reason)
    }

    fn open(&mut self, store: &mut S, place_id: PlaceId, ts: Timestamp) -> Result<Visit> {
        let id = store.allocate_visit_id()?;
        let visit = Visit::open(id, place_id, ts);
        store.insert_visit(&visit)?;

        // The visit row is the source of truth once written
        let mut next = self.state.snapshot();
        next.current_place_id = Some(place_id);
        next.current_visit_id = Some(id);
        next.last_transition_time = Some(ts);
        self.state.set(next.clone());
        self.phase = TrackerPhase::Active;
        self.diagnostics.opened += 1;
        log::info!("[VisitTracker] Opened visit {} at place {} ({})", id, place_id, ts);

        store.save_current_state(&next)?;
        Ok(visit)
    }

    fn close(&mut self, store: &mut S, current: &Visit, exit: Timestamp, reconciled: bool) -> Result<Visit> {
        self.phase = TrackerPhase::Closing;
        let mut closed = current.closed_at(exit);
        closed.reconciled = reconciled;

        if let Err(e) = store.close_visit(&closed) {
            self.phase = TrackerPhase::Active;
            log::error!("[VisitTracker] Failed to close visit {}: {}", current.id, e);
            return Err(e);
        }

        let mut next = self.state.snapshot();
        next.current_place_id = None;
        next.current_visit_id = None;
        next.last_transition_time = Some(exit);
        self.state.set(next.clone());
        self.phase = TrackerPhase::Closed;
        self.diagnostics.closed += 1;
        log::info!(
            "[VisitTracker] Closed visit {} at place {} ({}s)",
            closed.id,
            closed.place_id,
            closed.duration_secs
        );

        store.save_current_state(&next)?;
        Ok(closed)
    }
}

fn forced_exit_time(visit: &Visit, last_fix_time: Option<Timestamp>) -> Timestamp {
    last_fix_time
        .filter(|&t| t > visit.entry_time)
        .unwrap_or(visit.entry_time + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::{Place, PlaceStatus};

    const T10_00: Timestamp = 36_000;
    const MIN: Timestamp = 60;

    fn place(id: PlaceId) -> Place {
        Place {
            id,
            centroid_lat: 47.0 + id as f64 * 0.01,
            centroid_lon: 8.0,
            radius_m: 50.0,
            category: Category::Other,
            confidence: 0.7,
            visit_count: 0,
            total_time_spent_secs: 0,
            status: PlaceStatus::Confirmed,
            user_corrected: false,
            created_at: 0,
        }
    }

    fn tracker_with_places(ids: &[PlaceId]) -> (VisitTracker<MemoryStore>, SharedStore<MemoryStore>) {
        let store = MemoryStore::shared();
        {
            let mut s = store.lock().unwrap();
            for &id in ids {
                s.upsert_place(&place(id)).unwrap();
            }
        }
        let tracker = VisitTracker::new(Arc::clone(&store), VisitConfig::default()).unwrap();
        (tracker, store)
    }

    fn enter(place_id: PlaceId, ts: Timestamp) -> BoundaryEvent {
        BoundaryEvent::new(place_id, ts, EventSource::Geofence)
    }

    #[test]
    fn test_enter_then_exit() {
        let (mut tracker, store) = tracker_with_places(&[7]);

        let opened = tracker.enter(&enter(7, T10_00)).unwrap();
        assert!(matches!(opened, TransitionOutcome::Opened(_)));
        assert_eq!(tracker.phase(), TrackerPhase::Active);
        assert_eq!(tracker.current_state().current_place_id, Some(7));

        let outcome = tracker.exit(&enter(7, T10_00 + 90 * MIN)).unwrap();
        let TransitionOutcome::Closed(visit) = outcome else {
            panic!("expected close, got {:?}", outcome);
        };
        assert_eq!(visit.entry_time, T10_00);
        assert_eq!(visit.exit_time, Some(T10_00 + 90 * MIN));
        assert_eq!(visit.duration_secs, 90 * MIN);
        assert_eq!(tracker.phase(), TrackerPhase::Closed);
        assert_eq!(tracker.current_state().current_visit_id, None);

        let p = store.lock().unwrap().get_place(7).unwrap().unwrap();
        assert_eq!(p.visit_count, 1);
        assert_eq!(p.total_time_spent_secs, 90 * MIN);
    }

    #[test]
    fn test_implicit_exit_on_enter_elsewhere() {
        let (mut tracker, _store) = tracker_with_places(&[7, 9]);
        tracker.enter(&enter(7, T10_00)).unwrap();

        let outcome = tracker.enter(&enter(9, T10_00 + 5 * MIN)).unwrap();
        let TransitionOutcome::Switched { closed, opened } = outcome else {
            panic!("expected switch, got {:?}", outcome);
        };
        assert_eq!(closed.place_id, 7);
        assert_eq!(closed.exit_time, Some(T10_00 + 5 * MIN));
        assert_eq!(closed.duration_secs, 5 * MIN);
        assert_eq!(opened.place_id, 9);
        assert_eq!(opened.entry_time, T10_00 + 5 * MIN);
        assert_eq!(tracker.diagnostics().implicit_exits, 1);
    }

    #[test]
    fn test_duplicate_enter_is_noop() {
        let (mut tracker, store) = tracker_with_places(&[7]);
        tracker.enter(&enter(7, T10_00)).unwrap();
        let dup = BoundaryEvent::new(7, T10_00 + MIN, EventSource::Proximity);
        assert_eq!(tracker.enter(&dup).unwrap(), TransitionOutcome::Duplicate);
        assert_eq!(store.lock().unwrap().open_visits().unwrap().len(), 1);
    }

    #[test]
    fn test_unmatched_exit_is_counted() {
        let (mut tracker, _store) = tracker_with_places(&[7, 9]);
        let outcome = tracker.exit(&enter(7, T10_00)).unwrap();
        assert_eq!(outcome, TransitionOutcome::Ignored(StaleReason::NoActiveVisit));

        tracker.enter(&enter(9, T10_00)).unwrap();
        let outcome = tracker.exit(&enter(7, T10_00 + MIN)).unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Ignored(StaleReason::PlaceMismatch { active_place_id: 9 })
        );
        assert_eq!(tracker.diagnostics().stale_events, 2);
    }

    #[test]
    fn test_unknown_place_is_stale() {
        let (mut tracker, _store) = tracker_with_places(&[7]);
        let outcome = tracker.enter(&enter(42, T10_00)).unwrap();
        assert_eq!(outcome, TransitionOutcome::Ignored(StaleReason::UnknownPlace));
    }

    #[test]
    fn test_delayed_events_do_not_overlap() {
        let (mut tracker, _store) = tracker_with_places(&[7, 9]);
        tracker.enter(&enter(7, T10_00)).unwrap();
        tracker.exit(&enter(7, T10_00 + 30 * MIN)).unwrap();

        // Delayed enter from before the last exit
        let outcome = tracker.enter(&enter(9, T10_00 + 10 * MIN)).unwrap();
        assert_eq!(outcome, TransitionOutcome::Ignored(StaleReason::BeforeLastTransition));

        // Exit before entry
        tracker.enter(&enter(9, T10_00 + 40 * MIN)).unwrap();
        let outcome = tracker.exit(&enter(9, T10_00 + 40 * MIN)).unwrap();
        assert_eq!(outcome, TransitionOutcome::Ignored(StaleReason::AtOrBeforeEntry));
    }

    #[test]
    fn test_failed_close_keeps_visit_active() {
        let (mut tracker, store) = tracker_with_places(&[7]);
        tracker.enter(&enter(7, T10_00)).unwrap();

        store.lock().unwrap().set_failing(true);
        let result = tracker.exit(&enter(7, T10_00 + MIN));
        assert!(matches!(result, Err(PlaceTrackerError::PersistenceError { .. })));
        assert_eq!(tracker.phase(), TrackerPhase::Active);
        assert_eq!(tracker.current_state().current_place_id, Some(7));

        store.lock().unwrap().set_failing(false);
        assert!(matches!(
            tracker.exit(&enter(7, T10_00 + 2 * MIN)).unwrap(),
            TransitionOutcome::Closed(_)
        ));
    }

    #[test]
    fn test_sweep_uses_last_fix_time() {
        let (mut tracker, _store) = tracker_with_places(&[7]);
        tracker.enter(&enter(7, T10_00)).unwrap();
        tracker.note_fix(T10_00 + 3 * 3600).unwrap();

        // Within the cap: nothing happens
        assert!(tracker.reconciliation_sweep(T10_00 + 10 * 3600).unwrap().is_empty());

        let closed = tracker.reconciliation_sweep(T10_00 + 30 * 3600).unwrap();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].reconciled);
        assert_eq!(closed[0].exit_time, Some(T10_00 + 3 * 3600));
        assert_eq!(tracker.current_state().current_visit_id, None);
        assert_eq!(tracker.diagnostics().reconciled_visits, 1);
    }

    #[test]
    fn test_restart_reconciles_orphans() {
        let store = MemoryStore::shared();
        {
            let mut s = store.lock().unwrap();
            s.upsert_place(&place(7)).unwrap();
            s.upsert_place(&place(9)).unwrap();
            s.insert_visit(&Visit::open(1, 7, T10_00)).unwrap();
            s.insert_visit(&Visit::open(2, 9, T10_00 + MIN)).unwrap();
            s.save_current_state(&CurrentState {
                current_place_id: Some(9),
                current_visit_id: Some(2),
                last_fix_time: Some(T10_00 + 20 * MIN),
                last_transition_time: Some(T10_00 + MIN),
            })
            .unwrap();
        }

        let tracker = VisitTracker::new(Arc::clone(&store), VisitConfig::default()).unwrap();
        assert_eq!(tracker.current_state().current_visit_id, Some(2));
        assert_eq!(tracker.phase(), TrackerPhase::Active);

        let s = store.lock().unwrap();
        let orphan = s.get_visit(1).unwrap().unwrap();
        assert!(orphan.reconciled);
        assert_eq!(orphan.exit_time, Some(T10_00 + 20 * MIN));
        assert_eq!(s.open_visits().unwrap().len(), 1);
    }

    #[test]
    fn test_restart_clears_dangling_pointer() {
        let store = MemoryStore::shared();
        store
            .lock()
            .unwrap()
            .save_current_state(&CurrentState {
                current_place_id: Some(3),
                current_visit_id: Some(99),
                last_fix_time: None,
                last_transition_time: None,
            })
            .unwrap();

        let tracker = VisitTracker::new(Arc::clone(&store), VisitConfig::default()).unwrap();
        assert_eq!(tracker.current_state().current_visit_id, None);
        assert_eq!(tracker.phase(), TrackerPhase::NoVisit);
    }

    #[test]
    fn test_platform_event_json() {
        let event = PlatformEvent::from_json(r#"{"type":"enter","place_id":7,"timestamp":36000}"#).unwrap();
        assert_eq!(event, PlatformEvent::enter(7, 36_000));

        let event = PlatformEvent::from_json(
            r#"{"type":"exit","place_id":7,"timestamp":41400,"source":"proximity"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            PlatformEvent::Exit(BoundaryEvent { source: EventSource::Proximity, .. })
        ));

        let event = PlatformEvent::from_json(r#"{"type":"correction","place_id":7,"category":"gym"}"#).unwrap();
        assert!(matches!(
            event,
            PlatformEvent::Correction(CorrectionEvent { category: Category::Gym, .. })
        ));

        assert!(PlatformEvent::from_json(r#"{"type":"teleport","place_id":7}"#).is_err());
    }
}

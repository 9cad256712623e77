//! # Persistence Collaborator
//!
//! The [`PlaceStore`] trait is the seam to the persistence engine: CRUD and
//! range queries over fixes, places and visits, plus the single-row
//! [`CurrentState`] and [`CategoryProfile`] upserts.
//!
//! [`MemoryStore`] is the in-process implementation used by default and in
//! tests. The SQLite implementation lives in `persistence` behind the
//! `persistence` feature.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::categorizer::CategoryProfile;
use crate::error::{PlaceTrackerError, Result};
use crate::{CurrentState, Fix, Place, PlaceId, TimeRange, Timestamp, Visit, VisitId};

/// Store shared between the visit tracker, the detection pass and readers.
pub type SharedStore<S> = Arc<Mutex<S>>;

/// Lock a shared store, mapping a poisoned lock to an internal error.
pub fn lock_store<S>(store: &SharedStore<S>) -> Result<std::sync::MutexGuard<'_, S>> {
    store.lock().map_err(|_| PlaceTrackerError::Internal {
        message: "store lock poisoned".to_string(),
    })
}

/// Persistence operations required by the engine.
///
/// Every write either fully succeeds or returns `Err` leaving the store
/// unchanged. `close_visit` in particular must update the visit and the
/// owning place's counters together.
pub trait PlaceStore: Send {
    // ---- Fixes ----

    fn insert_fix(&mut self, fix: &Fix) -> Result<()>;

    /// Fixes whose timestamp lies in `range`, in insertion order.
    fn fixes_in_range(&self, range: &TimeRange) -> Result<Vec<Fix>>;

    fn fix_count(&self) -> Result<usize>;

    /// Delete fixes older than `cutoff`, returning how many were removed.
    fn prune_fixes_before(&mut self, cutoff: Timestamp) -> Result<usize>;

    // ---- Places ----

    fn allocate_place_id(&mut self) -> Result<PlaceId>;

    fn upsert_place(&mut self, place: &Place) -> Result<()>;

    fn get_place(&self, id: PlaceId) -> Result<Option<Place>>;

    /// All places ordered by id.
    fn places(&self) -> Result<Vec<Place>>;

    /// Delete a place and its visits. Returns false if it did not exist.
    fn delete_place(&mut self, id: PlaceId) -> Result<bool>;

    // ---- Visits ----

    fn allocate_visit_id(&mut self) -> Result<VisitId>;

    fn insert_visit(&mut self, visit: &Visit) -> Result<()>;

    /// Persist a closed visit and add its duration to the place:
    /// `visit_count += 1`, `total_time_spent += duration`.
    fn close_visit(&mut self, visit: &Visit) -> Result<()>;

    fn get_visit(&self, id: VisitId) -> Result<Option<Visit>>;

    fn open_visits(&self) -> Result<Vec<Visit>>;

    /// Visits overlapping `range` (open visits extend to infinity), ordered
    /// by entry time.
    fn visits_in_range(&self, range: &TimeRange) -> Result<Vec<Visit>>;

    // ---- Singletons ----

    fn load_current_state(&self) -> Result<CurrentState>;

    fn save_current_state(&mut self, state: &CurrentState) -> Result<()>;

    fn load_profile(&self) -> Result<Option<CategoryProfile>>;

    fn save_profile(&mut self, profile: &CategoryProfile) -> Result<()>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory [`PlaceStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    fixes: Vec<Fix>,
    places: BTreeMap<PlaceId, Place>,
    visits: BTreeMap<VisitId, Visit>,
    current_state: CurrentState,
    profile: Option<CategoryProfile>,
    next_place_id: PlaceId,
    next_visit_id: VisitId,
    failing: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store wrapped for sharing.
    pub fn shared() -> SharedStore<Self> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Make every subsequent write fail with a persistence error. Used to
    /// exercise failure handling.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing {
            return Err(PlaceTrackerError::persistence("simulated write failure"));
        }
        Ok(())
    }
}

impl PlaceStore for MemoryStore {
    fn insert_fix(&mut self, fix: &Fix) -> Result<()> {
        self.check_writable()?;
        self.fixes.push(fix.clone());
        Ok(())
    }

    fn fixes_in_range(&self, range: &TimeRange) -> Result<Vec<Fix>> {
        Ok(self
            .fixes
            .iter()
            .filter(|f| range.contains(f.timestamp))
            .cloned()
            .collect())
    }

    fn fix_count(&self) -> Result<usize> {
        Ok(self.fixes.len())
    }

    fn prune_fixes_before(&mut self, cutoff: Timestamp) -> Result<usize> {
        self.check_writable()?;
        let before = self.fixes.len();
        self.fixes.retain(|f| f.timestamp >= cutoff);
        Ok(before - self.fixes.len())
    }

    fn allocate_place_id(&mut self) -> Result<PlaceId> {
        self.check_writable()?;
        self.next_place_id += 1;
        Ok(self.next_place_id)
    }

    fn upsert_place(&mut self, place: &Place) -> Result<()> {
        self.check_writable()?;
        self.next_place_id = self.next_place_id.max(place.id);
        self.places.insert(place.id, place.clone());
        Ok(())
    }

    fn get_place(&self, id: PlaceId) -> Result<Option<Place>> {
        Ok(self.places.get(&id).cloned())
    }

    fn places(&self) -> Result<Vec<Place>> {
        Ok(self.places.values().cloned().collect())
    }

    fn delete_place(&mut self, id: PlaceId) -> Result<bool> {
        self.check_writable()?;
        let existed = self.places.remove(&id).is_some();
        self.visits.retain(|_, v| v.place_id != id);
        Ok(existed)
    }

    fn allocate_visit_id(&mut self) -> Result<VisitId> {
        self.check_writable()?;
        self.next_visit_id += 1;
        Ok(self.next_visit_id)
    }

    fn insert_visit(&mut self, visit: &Visit) -> Result<()> {
        self.check_writable()?;
        self.next_visit_id = self.next_visit_id.max(visit.id);
        self.visits.insert(visit.id, visit.clone());
        Ok(())
    }

    fn close_visit(&mut self, visit: &Visit) -> Result<()> {
        self.check_writable()?;
        if visit.is_open() {
            return Err(PlaceTrackerError::Internal {
                message: format!("visit {} has no exit time", visit.id),
            });
        }
        if !self.visits.contains_key(&visit.id) {
            return Err(PlaceTrackerError::persistence(format!(
                "visit {} not found",
                visit.id
            )));
        }
        if let Some(place) = self.places.get_mut(&visit.place_id) {
            place.visit_count += 1;
            place.total_time_spent_secs += visit.duration_secs;
        }
        self.visits.insert(visit.id, visit.clone());
        Ok(())
    }

    fn get_visit(&self, id: VisitId) -> Result<Option<Visit>> {
        Ok(self.visits.get(&id).cloned())
    }

    fn open_visits(&self) -> Result<Vec<Visit>> {
        Ok(self.visits.values().filter(|v| v.is_open()).cloned().collect())
    }

    fn visits_in_range(&self, range: &TimeRange) -> Result<Vec<Visit>> {
        let mut result: Vec<Visit> = self
            .visits
            .values()
            .filter(|v| range.overlaps(v.entry_time, v.exit_time.unwrap_or(Timestamp::MAX)))
            .cloned()
            .collect();
        result.sort_by_key(|v| (v.entry_time, v.id));
        Ok(result)
    }

    fn load_current_state(&self) -> Result<CurrentState> {
        Ok(self.current_state.clone())
    }

    fn save_current_state(&mut self, state: &CurrentState) -> Result<()> {
        self.check_writable()?;
        self.current_state = state.clone();
        Ok(())
    }

    fn load_profile(&self) -> Result<Option<CategoryProfile>> {
        Ok(self.profile.clone())
    }

    fn save_profile(&mut self, profile: &CategoryProfile) -> Result<()> {
        self.check_writable()?;
        self.profile = Some(profile.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Category, PlaceStatus};

    fn place(id: PlaceId) -> Place {
        Place {
            id,
            centroid_lat: 47.0,
            centroid_lon: 8.0,
            radius_m: 30.0,
            category: Category::Home,
            confidence: 0.8,
            visit_count: 0,
            total_time_spent_secs: 0,
            status: PlaceStatus::Confirmed,
            user_corrected: false,
            created_at: 0,
        }
    }

    #[test]
    fn test_close_visit_updates_place() {
        let mut store = MemoryStore::new();
        store.upsert_place(&place(7)).unwrap();
        let visit = Visit::open(1, 7, 36_000);
        store.insert_visit(&visit).unwrap();

        store.close_visit(&visit.closed_at(41_400)).unwrap();

        let p = store.get_place(7).unwrap().unwrap();
        assert_eq!(p.visit_count, 1);
        assert_eq!(p.total_time_spent_secs, 5_400);
        assert!(store.open_visits().unwrap().is_empty());
    }

    #[test]
    fn test_failing_close_leaves_state() {
        let mut store = MemoryStore::new();
        store.upsert_place(&place(7)).unwrap();
        let visit = Visit::open(1, 7, 100);
        store.insert_visit(&visit).unwrap();

        store.set_failing(true);
        assert!(store.close_visit(&visit.closed_at(200)).is_err());
        store.set_failing(false);

        assert_eq!(store.get_place(7).unwrap().unwrap().visit_count, 0);
        assert!(store.get_visit(1).unwrap().unwrap().is_open());
    }

    #[test]
    fn test_visits_in_range_includes_open() {
        let mut store = MemoryStore::new();
        store.insert_visit(&Visit::open(1, 7, 100).closed_at(200)).unwrap();
        store.insert_visit(&Visit::open(2, 7, 300)).unwrap();

        let hits = store.visits_in_range(&TimeRange::new(250, 1000)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 2);
        assert_eq!(store.visits_in_range(&TimeRange::new(0, 10_000)).unwrap().len(), 2);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut store = MemoryStore::new();
        store.upsert_place(&place(10)).unwrap();
        assert_eq!(store.allocate_place_id().unwrap(), 11);
        assert!(store.delete_place(10).unwrap());
        assert_eq!(store.allocate_place_id().unwrap(), 12);
    }

    #[test]
    fn test_prune_fixes() {
        let mut store = MemoryStore::new();
        for ts in [10, 20, 30, 40] {
            store.insert_fix(&Fix::new(47.0, 8.0, 5.0, ts)).unwrap();
        }
        assert_eq!(store.prune_fixes_before(25).unwrap(), 2);
        assert_eq!(store.fix_count().unwrap(), 2);
    }
}

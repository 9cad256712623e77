//! SQLite-backed engine across restarts.
//!
//! Run with: `cargo test --features persistence --test persistence_roundtrip`

use std::sync::{Arc, Mutex};

use place_tracker::{
    Category, CurrentState, EngineConfig, Place, PlaceEngine, PlaceStatus, PlaceStore, PlatformEvent, SqliteStore,
    TimeRange, Timestamp, Visit,
};
use tempfile::TempDir;

// Monday 2024-01-15 10:00 UTC
const T10_00: Timestamp = 1_705_312_800;

fn open_engine(dir: &TempDir) -> PlaceEngine<SqliteStore> {
    let path = dir.path().join("places.db");
    let store = SqliteStore::open(path.to_str().unwrap()).expect("open db");
    PlaceEngine::new(Arc::new(Mutex::new(store)), EngineConfig::default()).expect("engine")
}

fn place(id: u64) -> Place {
    Place {
        id,
        centroid_lat: 47.3769,
        centroid_lon: 8.5417 + id as f64 * 0.01,
        radius_m: 45.0,
        category: Category::Home,
        confidence: 0.9,
        visit_count: 0,
        total_time_spent_secs: 0,
        status: PlaceStatus::Confirmed,
        user_corrected: false,
        created_at: T10_00,
    }
}

#[test]
fn test_active_visit_survives_restart() {
    let dir = TempDir::new().expect("temp dir");
    {
        let engine = open_engine(&dir);
        engine.store().lock().unwrap().upsert_place(&place(1)).unwrap();
        engine.handle_event(&PlatformEvent::enter(1, T10_00)).unwrap();
    }

    let engine = open_engine(&dir);
    let state = engine.get_current_state();
    assert_eq!(state.current_place_id, Some(1));
    assert!(state.current_visit_id.is_some());

    engine.handle_event(&PlatformEvent::exit(1, T10_00 + 1800)).unwrap();
    let p = engine.get_place(1).unwrap();
    assert_eq!(p.visit_count, 1);
    assert_eq!(p.total_time_spent_secs, 1800);
}

#[test]
fn test_orphan_visit_reconciled_on_startup() {
    let dir = TempDir::new().expect("temp dir");
    {
        let path = dir.path().join("places.db");
        let mut store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        store.upsert_place(&place(1)).unwrap();
        store.upsert_place(&place(2)).unwrap();
        // Open visit at place 1 that CurrentState no longer points to
        store.insert_visit(&Visit::open(1, 1, T10_00)).unwrap();
        store.insert_visit(&Visit::open(2, 2, T10_00 + 600)).unwrap();
        store
            .save_current_state(&CurrentState {
                current_place_id: Some(2),
                current_visit_id: Some(2),
                last_fix_time: Some(T10_00 + 900),
                last_transition_time: Some(T10_00 + 600),
            })
            .unwrap();
    }

    let engine = open_engine(&dir);
    let visits = engine.get_visits(&TimeRange::new(T10_00, T10_00 + 3600)).unwrap();
    assert_eq!(visits.len(), 2);
    assert!(visits[0].reconciled);
    assert_eq!(visits[0].exit_time, Some(T10_00 + 900));
    assert!(visits[1].is_open());
    assert_eq!(engine.diagnostics().unwrap().reconciled_visits, 1);
}

#[test]
fn test_corrections_rejections_and_ids_persist() {
    let dir = TempDir::new().expect("temp dir");
    {
        let mut engine = open_engine(&dir);
        engine.store().lock().unwrap().upsert_place(&place(1)).unwrap();
        engine.store().lock().unwrap().upsert_place(&place(2)).unwrap();
        engine.record_correction(1, Category::Work).unwrap();
        engine.reject_place(2).unwrap();
    }

    let engine = open_engine(&dir);
    let p = engine.get_place(1).unwrap();
    assert_eq!(p.category, Category::Work);
    assert!(p.user_corrected);

    let store = engine.store();
    let mut store = store.lock().unwrap();
    let profile = store.load_profile().unwrap().expect("profile saved");
    assert!(profile.weight(Category::Work) > profile.weight(Category::Home));
    assert_eq!(profile.rejected_areas.len(), 1);
    // Deleted ids are not handed out again
    assert_eq!(store.allocate_place_id().unwrap(), 3);
}

//! # SQLite Place Store
//!
//! [`PlaceStore`] backed by SQLite.
//!
//! ## Tables
//!
//! - `fixes`: accepted fixes, append-only until pruned
//! - `places`, `visits`: one row each, visits cascade with their place
//! - `current_state`: single row
//! - `category_profile`: single row, msgpack blob
//! - `id_counters`: monotonic id allocation so ids are never reused
//!
//! Visit closure and place deletion run in a transaction.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::categorizer::CategoryProfile;
use crate::error::{PlaceTrackerError, Result};
use crate::store::PlaceStore;
use crate::{
    Category, CurrentState, Fix, Place, PlaceId, PlaceStatus, Provider, TimeRange, Timestamp, Visit, VisitId,
};

const PLACE_COUNTER: &str = "place";
const VISIT_COUNTER: &str = "visit";

const PLACE_COLUMNS: &str = "id, centroid_lat, centroid_lon, radius_m, category, confidence, \
     visit_count, total_time_spent_secs, status, user_corrected, created_at";

const VISIT_COLUMNS: &str = "id, place_id, entry_time, exit_time, duration_secs, reconciled";

/// SQLite-backed store.
pub struct SqliteStore {
    db: Connection,
    db_path: String,
}

impl SqliteStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a database at the given path.
    pub fn open(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        log::info!("[SqliteStore] Opened {}", db_path);
        Ok(Self {
            db,
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Accepted fixes, in insertion order
            CREATE TABLE IF NOT EXISTS fixes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy_m REAL NOT NULL,
                speed_mps REAL,
                bearing_deg REAL,
                provider TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS places (
                id INTEGER PRIMARY KEY,
                centroid_lat REAL NOT NULL,
                centroid_lon REAL NOT NULL,
                radius_m REAL NOT NULL,
                category TEXT NOT NULL,
                confidence REAL NOT NULL,
                visit_count INTEGER NOT NULL DEFAULT 0,
                total_time_spent_secs INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                user_corrected INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS visits (
                id INTEGER PRIMARY KEY,
                place_id INTEGER NOT NULL,
                entry_time INTEGER NOT NULL,
                exit_time INTEGER,
                duration_secs INTEGER NOT NULL DEFAULT 0,
                reconciled INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (place_id) REFERENCES places(id) ON DELETE CASCADE
            );

            -- Single-row tables
            CREATE TABLE IF NOT EXISTS current_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                current_place_id INTEGER,
                current_visit_id INTEGER,
                last_fix_time INTEGER,
                last_transition_time INTEGER
            );

            CREATE TABLE IF NOT EXISTS category_profile (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS id_counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_fixes_timestamp ON fixes(timestamp);
            CREATE INDEX IF NOT EXISTS idx_visits_place ON visits(place_id);
            CREATE INDEX IF NOT EXISTS idx_visits_entry ON visits(entry_time);
            CREATE INDEX IF NOT EXISTS idx_visits_open ON visits(exit_time) WHERE exit_time IS NULL;

            -- Enable foreign keys
            PRAGMA foreign_keys = ON;
        "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn next_id(&mut self, counter: &str) -> Result<u64> {
        self.db.execute(
            "INSERT INTO id_counters (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![counter],
        )?;
        let value: i64 = self.db.query_row(
            "SELECT value FROM id_counters WHERE name = ?1",
            params![counter],
            |row| row.get(0),
        )?;
        Ok(value as u64)
    }

    fn bump_counter(conn: &Connection, counter: &str, at_least: u64) -> Result<()> {
        conn.execute(
            "INSERT INTO id_counters (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
            params![counter, at_least as i64],
        )?;
        Ok(())
    }

    fn query_visits(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Visit>> {
        let mut stmt = self.db.prepare(sql)?;
        let visits = stmt
            .query_map(args, visit_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(visits)
    }
}

fn fix_from_row(row: &Row<'_>) -> rusqlite::Result<Fix> {
    let provider: String = row.get(6)?;
    Ok(Fix {
        timestamp: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        accuracy_m: row.get(3)?,
        speed_mps: row.get(4)?,
        bearing_deg: row.get(5)?,
        provider: Provider::parse(&provider).unwrap_or_default(),
    })
}

fn place_from_row(row: &Row<'_>) -> rusqlite::Result<Place> {
    let category: String = row.get(4)?;
    let status: String = row.get(8)?;
    Ok(Place {
        id: row.get::<_, i64>(0)? as PlaceId,
        centroid_lat: row.get(1)?,
        centroid_lon: row.get(2)?,
        radius_m: row.get(3)?,
        category: Category::parse(&category).unwrap_or(Category::Other),
        confidence: row.get(5)?,
        visit_count: row.get(6)?,
        total_time_spent_secs: row.get(7)?,
        status: status_from_str(&status),
        user_corrected: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn visit_from_row(row: &Row<'_>) -> rusqlite::Result<Visit> {
    Ok(Visit {
        id: row.get::<_, i64>(0)? as VisitId,
        place_id: row.get::<_, i64>(1)? as PlaceId,
        entry_time: row.get(2)?,
        exit_time: row.get(3)?,
        duration_secs: row.get(4)?,
        reconciled: row.get(5)?,
    })
}

fn status_as_str(status: PlaceStatus) -> &'static str {
    match status {
        PlaceStatus::Confirmed => "confirmed",
        PlaceStatus::PendingReview => "pending_review",
    }
}

fn status_from_str(s: &str) -> PlaceStatus {
    match s {
        "pending_review" => PlaceStatus::PendingReview,
        _ => PlaceStatus::Confirmed,
    }
}

fn opt_id(id: Option<u64>) -> Option<i64> {
    id.map(|v| v as i64)
}

impl PlaceStore for SqliteStore {
    // ---- Fixes ----

    fn insert_fix(&mut self, fix: &Fix) -> Result<()> {
        self.db.execute(
            "INSERT INTO fixes (timestamp, latitude, longitude, accuracy_m, speed_mps, bearing_deg, provider)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fix.timestamp,
                fix.latitude,
                fix.longitude,
                fix.accuracy_m,
                fix.speed_mps,
                fix.bearing_deg,
                fix.provider.as_str()
            ],
        )?;
        Ok(())
    }

    fn fixes_in_range(&self, range: &TimeRange) -> Result<Vec<Fix>> {
        let mut stmt = self.db.prepare(
            "SELECT timestamp, latitude, longitude, accuracy_m, speed_mps, bearing_deg, provider
             FROM fixes WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY seq",
        )?;
        let fixes = stmt
            .query_map(params![range.start, range.end], fix_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(fixes)
    }

    fn fix_count(&self) -> Result<usize> {
        let count: i64 = self.db.query_row("SELECT COUNT(*) FROM fixes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn prune_fixes_before(&mut self, cutoff: Timestamp) -> Result<usize> {
        let removed = self
            .db
            .execute("DELETE FROM fixes WHERE timestamp < ?1", params![cutoff])?;
        Ok(removed)
    }

    // ---- Places ----

    fn allocate_place_id(&mut self) -> Result<PlaceId> {
        self.next_id(PLACE_COUNTER)
    }

    fn upsert_place(&mut self, place: &Place) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO places ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    centroid_lat = excluded.centroid_lat,
                    centroid_lon = excluded.centroid_lon,
                    radius_m = excluded.radius_m,
                    category = excluded.category,
                    confidence = excluded.confidence,
                    visit_count = excluded.visit_count,
                    total_time_spent_secs = excluded.total_time_spent_secs,
                    status = excluded.status,
                    user_corrected = excluded.user_corrected,
                    created_at = excluded.created_at",
                PLACE_COLUMNS
            ),
            params![
                place.id as i64,
                place.centroid_lat,
                place.centroid_lon,
                place.radius_m,
                place.category.as_str(),
                place.confidence,
                place.visit_count,
                place.total_time_spent_secs,
                status_as_str(place.status),
                place.user_corrected,
                place.created_at
            ],
        )?;
        Self::bump_counter(&tx, PLACE_COUNTER, place.id)?;
        tx.commit()?;
        Ok(())
    }

    fn get_place(&self, id: PlaceId) -> Result<Option<Place>> {
        let place = self
            .db
            .query_row(
                &format!("SELECT {} FROM places WHERE id = ?1", PLACE_COLUMNS),
                params![id as i64],
                place_from_row,
            )
            .optional()?;
        Ok(place)
    }

    fn places(&self) -> Result<Vec<Place>> {
        let mut stmt = self
            .db
            .prepare(&format!("SELECT {} FROM places ORDER BY id", PLACE_COLUMNS))?;
        let places = stmt
            .query_map([], place_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(places)
    }

    fn delete_place(&mut self, id: PlaceId) -> Result<bool> {
        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM visits WHERE place_id = ?1", params![id as i64])?;
        let removed = tx.execute("DELETE FROM places WHERE id = ?1", params![id as i64])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    // ---- Visits ----

    fn allocate_visit_id(&mut self) -> Result<VisitId> {
        self.next_id(VISIT_COUNTER)
    }

    fn insert_visit(&mut self, visit: &Visit) -> Result<()> {
        let tx = self.db.transaction()?;
        tx.execute(
            &format!("INSERT INTO visits ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)", VISIT_COLUMNS),
            params![
                visit.id as i64,
                visit.place_id as i64,
                visit.entry_time,
                visit.exit_time,
                visit.duration_secs,
                visit.reconciled
            ],
        )?;
        Self::bump_counter(&tx, VISIT_COUNTER, visit.id)?;
        tx.commit()?;
        Ok(())
    }

    fn close_visit(&mut self, visit: &Visit) -> Result<()> {
        let Some(exit_time) = visit.exit_time else {
            return Err(PlaceTrackerError::Internal {
                message: format!("visit {} has no exit time", visit.id),
            });
        };

        let tx = self.db.transaction()?;
        let updated = tx.execute(
            "UPDATE visits SET exit_time = ?2, duration_secs = ?3, reconciled = ?4 WHERE id = ?1",
            params![visit.id as i64, exit_time, visit.duration_secs, visit.reconciled],
        )?;
        if updated == 0 {
            return Err(PlaceTrackerError::persistence(format!(
                "visit {} not found",
                visit.id
            )));
        }
        tx.execute(
            "UPDATE places SET visit_count = visit_count + 1,
                 total_time_spent_secs = total_time_spent_secs + ?2
             WHERE id = ?1",
            params![visit.place_id as i64, visit.duration_secs],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_visit(&self, id: VisitId) -> Result<Option<Visit>> {
        let visit = self
            .db
            .query_row(
                &format!("SELECT {} FROM visits WHERE id = ?1", VISIT_COLUMNS),
                params![id as i64],
                visit_from_row,
            )
            .optional()?;
        Ok(visit)
    }

    fn open_visits(&self) -> Result<Vec<Visit>> {
        self.query_visits(
            &format!(
                "SELECT {} FROM visits WHERE exit_time IS NULL ORDER BY id",
                VISIT_COLUMNS
            ),
            [],
        )
    }

    fn visits_in_range(&self, range: &TimeRange) -> Result<Vec<Visit>> {
        self.query_visits(
            &format!(
                "SELECT {} FROM visits
                 WHERE entry_time < ?2 AND (exit_time IS NULL OR exit_time > ?1)
                 ORDER BY entry_time, id",
                VISIT_COLUMNS
            ),
            params![range.start, range.end],
        )
    }

    // ---- Singletons ----

    fn load_current_state(&self) -> Result<CurrentState> {
        let state = self
            .db
            .query_row(
                "SELECT current_place_id, current_visit_id, last_fix_time, last_transition_time
                 FROM current_state WHERE id = 1",
                [],
                |row| {
                    Ok(CurrentState {
                        current_place_id: row.get::<_, Option<i64>>(0)?.map(|v| v as PlaceId),
                        current_visit_id: row.get::<_, Option<i64>>(1)?.map(|v| v as VisitId),
                        last_fix_time: row.get(2)?,
                        last_transition_time: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    fn save_current_state(&mut self, state: &CurrentState) -> Result<()> {
        self.db.execute(
            "INSERT OR REPLACE INTO current_state
                (id, current_place_id, current_visit_id, last_fix_time, last_transition_time)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                opt_id(state.current_place_id),
                opt_id(state.current_visit_id),
                state.last_fix_time,
                state.last_transition_time
            ],
        )?;
        Ok(())
    }

    fn load_profile(&self) -> Result<Option<CategoryProfile>> {
        let blob: Option<Vec<u8>> = self
            .db
            .query_row("SELECT data FROM category_profile WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match blob {
            Some(bytes) => rmp_serde::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PlaceTrackerError::persistence(format!("profile decode: {}", e))),
            None => Ok(None),
        }
    }

    fn save_profile(&mut self, profile: &CategoryProfile) -> Result<()> {
        let blob = rmp_serde::to_vec(profile)
            .map_err(|e| PlaceTrackerError::persistence(format!("profile encode: {}", e)))?;
        self.db.execute(
            "INSERT OR REPLACE INTO category_profile (id, data) VALUES (1, ?1)",
            params![blob],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(id: PlaceId) -> Place {
        Place {
            id,
            centroid_lat: 47.3769,
            centroid_lon: 8.5417,
            radius_m: 35.0,
            category: Category::Work,
            confidence: 0.75,
            visit_count: 0,
            total_time_spent_secs: 0,
            status: PlaceStatus::PendingReview,
            user_corrected: false,
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_place_round_trip() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.upsert_place(&place(4)).unwrap();
        assert_eq!(store.get_place(4).unwrap(), Some(place(4)));
        assert_eq!(store.allocate_place_id().unwrap(), 5);
        assert_eq!(store.get_place(99).unwrap(), None);
    }

    #[test]
    fn test_close_visit_is_atomic_with_place_counters() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.upsert_place(&place(1)).unwrap();
        let id = store.allocate_visit_id().unwrap();
        let visit = Visit::open(id, 1, 1_000);
        store.insert_visit(&visit).unwrap();
        assert_eq!(store.open_visits().unwrap().len(), 1);

        store.close_visit(&visit.closed_at(4_600)).unwrap();
        let p = store.get_place(1).unwrap().unwrap();
        assert_eq!(p.visit_count, 1);
        assert_eq!(p.total_time_spent_secs, 3_600);
        assert!(store.open_visits().unwrap().is_empty());

        // Unknown visit: nothing changes
        let ghost = Visit::open(42, 1, 5_000).closed_at(6_000);
        assert!(store.close_visit(&ghost).is_err());
        assert_eq!(store.get_place(1).unwrap().unwrap().visit_count, 1);
    }

    #[test]
    fn test_delete_place_cascades_visits() {
        let mut store = SqliteStore::in_memory().unwrap();
        store.upsert_place(&place(1)).unwrap();
        store.insert_visit(&Visit::open(1, 1, 100)).unwrap();
        assert!(store.delete_place(1).unwrap());
        assert!(store.get_visit(1).unwrap().is_none());
        assert!(!store.delete_place(1).unwrap());
    }

    #[test]
    fn test_fixes_range_and_prune() {
        let mut store = SqliteStore::in_memory().unwrap();
        for ts in [30, 10, 20] {
            store
                .insert_fix(&Fix::new(47.0, 8.0, 5.0, ts).with_speed(1.5).with_provider(Provider::Fused))
                .unwrap();
        }
        let fixes = store.fixes_in_range(&TimeRange::new(0, 100)).unwrap();
        // Insertion order, not timestamp order
        assert_eq!(fixes.iter().map(|f| f.timestamp).collect::<Vec<_>>(), vec![30, 10, 20]);
        assert_eq!(fixes[0].speed_mps, Some(1.5));
        assert_eq!(fixes[0].provider, Provider::Fused);

        assert_eq!(store.prune_fixes_before(25).unwrap(), 2);
        assert_eq!(store.fix_count().unwrap(), 1);
    }

    #[test]
    fn test_singletons() {
        let mut store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.load_current_state().unwrap(), CurrentState::default());
        assert!(store.load_profile().unwrap().is_none());

        let state = CurrentState {
            current_place_id: Some(3),
            current_visit_id: Some(8),
            last_fix_time: Some(1_000),
            last_transition_time: Some(900),
        };
        store.save_current_state(&state).unwrap();
        assert_eq!(store.load_current_state().unwrap(), state);

        let mut profile = CategoryProfile::default();
        profile.record_rejection(Category::Gym);
        store.save_profile(&profile).unwrap();
        assert_eq!(store.load_profile().unwrap(), Some(profile));
    }
}

//! Durable SQLite store for camera events.
//!
//! # Schema
//! - `events`: one row per event; (device_id, timestamp, artifact_ref) is
//!   the event identity, enforced with a unique index.  A duplicate insert
//!   fails that one insert only.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, foreign_keys=ON.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! The store handle is owned by the batch writer; other components read
//! through the in-memory cache seeded from `events_by_time_desc`.

use chrono::Local;
use rusqlite::{Connection, params};
use std::path::Path;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A camera event record.
///
/// `timestamp` is local time formatted `%Y-%m-%d %H:%M:%S`, so lexicographic
/// order is chronological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraEvent {
    pub device_id: String,
    pub timestamp: String,
    pub artifact_ref: String,
    pub viewed: bool,
}

/// Error type for store operations.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    IntegrityCheckFailed(String),
    InvalidData(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {}", e),
            StoreError::IntegrityCheckFailed(s) => write!(f, "Integrity check failed: {}", s),
            StoreError::InvalidData(s) => write!(f, "Invalid data: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

// ---------------------------------------------------------------------------
// EventStore struct
// ---------------------------------------------------------------------------

/// The durable event store for a single console instance.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open (or create) the store at the given path.
    ///
    /// Applies PRAGMAs, runs `PRAGMA integrity_check`, and creates tables if
    /// needed.  Returns `Err` if integrity_check fails.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        Ok(EventStore { conn })
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        Ok(EventStore { conn })
    }

    // -----------------------------------------------------------------------
    // Event persistence
    // -----------------------------------------------------------------------

    /// Insert one event.
    ///
    /// `device_id` and `artifact_ref` must be non-empty.  A second event with
    /// the same (device_id, timestamp, artifact_ref) identity is rejected by
    /// the unique index.
    pub fn insert_event(&mut self, event: &CameraEvent) -> Result<(), StoreError> {
        if event.device_id.is_empty() || event.artifact_ref.is_empty() {
            return Err(StoreError::InvalidData(
                "device_id and artifact_ref must not be empty".to_owned(),
            ));
        }

        let created_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        self.conn.execute(
            "INSERT INTO events (device_id, timestamp, artifact_ref, viewed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.device_id,
                event.timestamp,
                event.artifact_ref,
                i64::from(event.viewed),
                created_at,
            ],
        )?;
        Ok(())
    }

    /// Mark an event viewed by identity.  Returns true when a row changed.
    pub fn mark_viewed(
        &mut self,
        device_id: &str,
        timestamp: &str,
        artifact_ref: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE events SET viewed = 1
             WHERE device_id = ?1 AND timestamp = ?2 AND artifact_ref = ?3",
            params![device_id, timestamp, artifact_ref],
        )?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Query helpers
    // -----------------------------------------------------------------------

    /// Return all events ordered by timestamp descending (newest first).
    ///
    /// Used to seed the in-memory cache at startup.
    pub fn events_by_time_desc(&self) -> Result<Vec<CameraEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, timestamp, artifact_ref, viewed
             FROM events
             ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map([], map_event)?;
        let mut events = Vec::new();
        for r in rows {
            events.push(r?);
        }
        Ok(events)
    }

    /// Count unviewed events for a device.
    pub fn unviewed_count(&self, device_id: &str) -> Result<i64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE device_id = ?1 AND viewed = 0",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count all events for a device.
    pub fn count_for_device(&self, device_id: &str) -> Result<i64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count all events in the store.
    pub fn total_count(&self) -> Result<i64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}

fn map_event(row: &rusqlite::Row<'_>) -> Result<CameraEvent, rusqlite::Error> {
    Ok(CameraEvent {
        device_id: row.get(0)?,
        timestamp: row.get(1)?,
        artifact_ref: row.get(2)?,
        viewed: row.get::<_, i64>(3)? != 0,
    })
}

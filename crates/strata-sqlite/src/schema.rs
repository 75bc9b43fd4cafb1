use rusqlite::{params, Connection, OptionalExtension};
use strata_core::{Result, StrataError};

use crate::codec::db_err;

/// Version of the bookkeeping tables created by [`init_schema`]
pub const SCHEMA_VERSION: u32 = 1;

const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS strata_meta (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        schema_version INTEGER NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE IF NOT EXISTS projection_cursors (
        projection_name TEXT NOT NULL,
        aggregate_type TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (projection_name, instance_id, aggregate_type)
    )",
    "CREATE TABLE IF NOT EXISTS projection_locks (
        projection_name TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        locker_id TEXT NOT NULL,
        locked_until TEXT NOT NULL,
        PRIMARY KEY (projection_name, instance_id)
    )",
    "CREATE TABLE IF NOT EXISTS projection_failed_events (
        projection_name TEXT NOT NULL,
        failed_sequence INTEGER NOT NULL,
        instance_id TEXT NOT NULL,
        failure_count INTEGER NOT NULL,
        error TEXT NOT NULL,
        last_failed TEXT NOT NULL,
        PRIMARY KEY (projection_name, instance_id, failed_sequence)
    )",
    "CREATE TABLE IF NOT EXISTS events (
        sequence INTEGER PRIMARY KEY,
        instance_id TEXT NOT NULL,
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        previous_aggregate_sequence INTEGER NOT NULL,
        previous_aggregate_type_sequence INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        creator TEXT NOT NULL,
        created_at TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS events_instance_aggregate
        ON events (instance_id, aggregate_type, sequence)",
];

/// Create the bookkeeping tables and check the stored schema version
pub fn init_schema(conn: &Connection) -> Result<()> {
    for ddl in TABLES {
        conn.execute(ddl, []).map_err(db_err)?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO strata_meta (id, schema_version) VALUES (0, ?1)",
        params![SCHEMA_VERSION as i64],
    )
    .map_err(db_err)?;

    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(StrataError::InvalidState(format!(
            "database schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }
    if current < SCHEMA_VERSION {
        conn.execute(
            "UPDATE strata_meta SET schema_version = ?1, updated_at = datetime('now') WHERE id = 0",
            params![SCHEMA_VERSION as i64],
        )
        .map_err(db_err)?;
    }

    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM strata_meta WHERE id = 0",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;

    version
        .map(|v| v as u32)
        .ok_or_else(|| StrataError::NotFound("strata_meta row".into()))
}

//! Per-aggregate-type cursors of a projection instance

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use strata_core::{AggregateType, Cursor, Result, Sequence};

use crate::codec::{db_err, format_ts, from_i64, parse_ts, to_i64};

/// Read the cursors of `aggregate_types`; missing rows read as 0.
///
/// Must run inside a write transaction for the rows to stay locked.
pub fn read(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    aggregate_types: &[AggregateType],
) -> Result<HashMap<AggregateType, Sequence>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT sequence FROM projection_cursors
             WHERE projection_name = ?1 AND instance_id = ?2 AND aggregate_type = ?3",
        )
        .map_err(db_err)?;

    let mut cursors = HashMap::with_capacity(aggregate_types.len());
    for aggregate_type in aggregate_types {
        let sequence: Option<i64> = stmt
            .query_row(
                params![projection, instance_id, aggregate_type.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let sequence = sequence.map(from_i64).transpose()?.unwrap_or(0);
        cursors.insert(aggregate_type.clone(), sequence);
    }
    Ok(cursors)
}

/// Upsert cursors. A cursor never moves backwards.
pub fn write(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    cursors: &HashMap<AggregateType, Sequence>,
) -> Result<()> {
    let now = format_ts(Utc::now());
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO projection_cursors
                (projection_name, aggregate_type, instance_id, sequence, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (projection_name, instance_id, aggregate_type) DO UPDATE
             SET sequence = excluded.sequence, updated_at = excluded.updated_at
             WHERE excluded.sequence > projection_cursors.sequence",
        )
        .map_err(db_err)?;

    for (aggregate_type, sequence) in cursors {
        stmt.execute(params![
            projection,
            aggregate_type.as_str(),
            instance_id,
            to_i64(*sequence)?,
            now
        ])
        .map_err(db_err)?;
    }
    Ok(())
}

pub fn list(conn: &Connection, projection: &str, instance_id: &str) -> Result<Vec<Cursor>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT aggregate_type, sequence, updated_at FROM projection_cursors
             WHERE projection_name = ?1 AND instance_id = ?2
             ORDER BY aggregate_type",
        )
        .map_err(db_err)?;

    let rows = stmt
        .query_map(params![projection, instance_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(db_err)?;

    let mut cursors = Vec::new();
    for row in rows {
        let (aggregate_type, sequence, updated_at) = row.map_err(db_err)?;
        cursors.push(Cursor {
            projection_name: projection.to_string(),
            aggregate_type: aggregate_type.into(),
            instance_id: instance_id.to_string(),
            sequence: from_i64(sequence)?,
            updated_at: parse_ts(&updated_at)?,
        });
    }
    Ok(cursors)
}

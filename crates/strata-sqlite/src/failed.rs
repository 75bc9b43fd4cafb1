//! Failure bookkeeping for statements that could not be applied

use chrono::Utc;
use rusqlite::{params, Connection};
use strata_core::{FailedEvent, Result, Sequence};

use crate::codec::{db_err, format_ts, from_i64, parse_ts, to_i64};

/// Increment the failure count of an event and return the new count
pub fn record(
    conn: &Connection,
    projection: &str,
    instance_id: &str,
    sequence: Sequence,
    error: &str,
) -> Result<u32> {
    conn.execute(
        "INSERT INTO projection_failed_events
            (projection_name, failed_sequence, instance_id, failure_count, error, last_failed)
         VALUES (?1, ?2, ?3, 1, ?4, ?5)
         ON CONFLICT (projection_name, instance_id, failed_sequence) DO UPDATE
         SET failure_count = projection_failed_events.failure_count + 1,
             error = excluded.error,
             last_failed = excluded.last_failed",
        params![
            projection,
            to_i64(sequence)?,
            instance_id,
            error,
            format_ts(Utc::now())
        ],
    )
    .map_err(db_err)?;

    let count: i64 = conn
        .query_row(
            "SELECT failure_count FROM projection_failed_events
             WHERE projection_name = ?1 AND instance_id = ?2 AND failed_sequence = ?3",
            params![projection, instance_id, to_i64(sequence)?],
            |row| row.get(0),
        )
        .map_err(db_err)?;

    Ok(count as u32)
}

pub fn list(conn: &Connection, projection: &str) -> Result<Vec<FailedEvent>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT failed_sequence, instance_id, failure_count, error, last_failed
             FROM projection_failed_events
             WHERE projection_name = ?1
             ORDER BY last_failed DESC, failed_sequence DESC",
        )
        .map_err(db_err)?;

    let rows = stmt
        .query_map(params![projection], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })
        .map_err(db_err)?;

    let mut failed = Vec::new();
    for row in rows {
        let (sequence, instance_id, count, error, last_failed) = row.map_err(db_err)?;
        failed.push(FailedEvent {
            projection_name: projection.to_string(),
            failed_sequence: from_i64(sequence)?,
            instance_id,
            failure_count: count as u32,
            error,
            last_failed: parse_ts(&last_failed)?,
        });
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_schema;

    #[test]
    fn test_failure_count_increments() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(record(&conn, "users", "inst", 5, "boom").unwrap(), 1);
        assert_eq!(record(&conn, "users", "inst", 5, "boom again").unwrap(), 2);
        assert_eq!(record(&conn, "users", "other", 5, "boom").unwrap(), 1);

        let failed = list(&conn, "users").unwrap();
        assert_eq!(failed.len(), 2);
        let inst = failed.iter().find(|f| f.instance_id == "inst").unwrap();
        assert_eq!(inst.failure_count, 2);
        assert_eq!(inst.error, "boom again");
        assert!(list(&conn, "orgs").unwrap().is_empty());
    }
}

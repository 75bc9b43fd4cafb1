//! Lease rows: one per (projection, instance)

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use strata_core::{LeaseInfo, Result};

use crate::codec::{db_err, format_ts, parse_ts};

/// Take or extend all leases atomically. See
/// [`LeaseStore::try_lock`](strata_core::LeaseStore::try_lock).
pub fn try_lock(
    conn: &mut Connection,
    projection: &str,
    locker_id: &str,
    instance_ids: &[String],
    now: DateTime<Utc>,
    locked_until: DateTime<Utc>,
) -> Result<bool> {
    if instance_ids.is_empty() {
        return Ok(true);
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err)?;
    let now = format_ts(now);
    let until = format_ts(locked_until);
    {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO projection_locks (projection_name, instance_id, locker_id, locked_until)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (projection_name, instance_id) DO UPDATE
                 SET locker_id = excluded.locker_id, locked_until = excluded.locked_until
                 WHERE projection_locks.locker_id = excluded.locker_id
                    OR projection_locks.locked_until < ?5",
            )
            .map_err(db_err)?;

        for instance_id in instance_ids {
            let changed = stmt
                .execute(params![projection, instance_id, locker_id, until, now])
                .map_err(db_err)?;
            if changed == 0 {
                tracing::debug!(projection, instance = %instance_id, "lease held by another worker");
                // Dropping the transaction rolls back the rows taken so far
                return Ok(false);
            }
        }
    }
    tx.commit().map_err(db_err)?;
    Ok(true)
}

/// Expire the leases owned by `locker_id`
pub fn unlock(
    conn: &Connection,
    projection: &str,
    locker_id: &str,
    instance_ids: &[String],
    now: DateTime<Utc>,
) -> Result<()> {
    let now = format_ts(now);
    let mut stmt = conn
        .prepare_cached(
            "UPDATE projection_locks SET locked_until = ?1
             WHERE projection_name = ?2 AND instance_id = ?3 AND locker_id = ?4",
        )
        .map_err(db_err)?;
    for instance_id in instance_ids {
        stmt.execute(params![now, projection, instance_id, locker_id])
            .map_err(db_err)?;
    }
    Ok(())
}

pub fn list(conn: &Connection, projection: &str) -> Result<Vec<LeaseInfo>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT instance_id, locker_id, locked_until FROM projection_locks
             WHERE projection_name = ?1 ORDER BY instance_id",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![projection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(db_err)?;

    let mut leases = Vec::new();
    for row in rows {
        let (instance_id, locker_id, locked_until) = row.map_err(db_err)?;
        leases.push(LeaseInfo {
            projection_name: projection.to_string(),
            instance_id,
            locker_id,
            locked_until: parse_ts(&locked_until)?,
        });
    }
    Ok(leases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::init_schema;
    use chrono::Duration;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lease_exclusive_until_expired() {
        let mut conn = conn();
        let now = Utc::now();
        let until = now + Duration::seconds(30);

        assert!(try_lock(&mut conn, "p", "a", &ids(&["i1"]), now, until).unwrap());
        assert!(!try_lock(&mut conn, "p", "b", &ids(&["i1"]), now, until).unwrap());
        // owner may extend
        assert!(try_lock(&mut conn, "p", "a", &ids(&["i1"]), now, until).unwrap());
        // expired lease can be stolen
        let later = until + Duration::seconds(1);
        let renewed = later + Duration::seconds(30);
        assert!(try_lock(&mut conn, "p", "b", &ids(&["i1"]), later, renewed).unwrap());
        assert_eq!(list(&conn, "p").unwrap()[0].locker_id, "b");
    }

    #[test]
    fn test_group_is_all_or_nothing() {
        let mut conn = conn();
        let now = Utc::now();
        let until = now + Duration::seconds(30);

        assert!(try_lock(&mut conn, "p", "a", &ids(&["i2"]), now, until).unwrap());
        assert!(!try_lock(&mut conn, "p", "b", &ids(&["i1", "i2"]), now, until).unwrap());

        let leases = list(&conn, "p").unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].instance_id, "i2");
    }

    #[test]
    fn test_unlock_only_own_rows() {
        let mut conn = conn();
        let now = Utc::now();
        let until = now + Duration::seconds(30);
        assert!(try_lock(&mut conn, "p", "a", &ids(&["i1"]), now, until).unwrap());

        unlock(&conn, "p", "b", &ids(&["i1"]), now).unwrap();
        assert_eq!(format_ts(list(&conn, "p").unwrap()[0].locked_until), format_ts(until));

        unlock(&conn, "p", "a", &ids(&["i1"]), now).unwrap();
        let after = now + Duration::milliseconds(1);
        assert!(list(&conn, "p").unwrap()[0].is_expired_at(after));
        assert!(try_lock(&mut conn, "p", "b", &ids(&["i1"]), after, until).unwrap());
    }
}

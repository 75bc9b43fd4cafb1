use parking_lot::MutexGuard;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use strata_core::{
    AggregateType, Executor, ProjectionTxn, Result, Sequence, StrataError, Value,
};

use crate::codec::{db_err, to_sql};
use crate::{cursor, failed};

/// Write transaction over the projection tables
///
/// Holds the store's connection for its whole lifetime. Dropping the
/// transaction without committing rolls it back.
pub struct SqliteProjectionTxn<'a> {
    conn: MutexGuard<'a, Connection>,
    in_txn: bool,
}

impl<'a> SqliteProjectionTxn<'a> {
    pub fn new(conn: MutexGuard<'a, Connection>) -> Result<Self> {
        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")
            .map_err(db_err)?;

        Ok(Self { conn, in_txn: true })
    }

    fn check_savepoint_name(name: &str) -> Result<()> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StrataError::InvalidState(format!(
                "invalid savepoint name '{}'",
                name
            )));
        }
        Ok(())
    }
}

impl<'a> Executor for SqliteProjectionTxn<'a> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        let mut stmt = self.conn.prepare_cached(sql).map_err(db_err)?;
        stmt.execute(params_from_iter(params.iter().map(to_sql)))
            .map_err(db_err)
    }
}

impl<'a> ProjectionTxn for SqliteProjectionTxn<'a> {
    fn lock_cursors(
        &mut self,
        projection: &str,
        instance_id: &str,
        aggregate_types: &[AggregateType],
    ) -> Result<HashMap<AggregateType, Sequence>> {
        // BEGIN IMMEDIATE already holds the database write lock
        cursor::read(&self.conn, projection, instance_id, aggregate_types)
    }

    fn update_cursors(
        &mut self,
        projection: &str,
        instance_id: &str,
        cursors: &HashMap<AggregateType, Sequence>,
    ) -> Result<()> {
        cursor::write(&self.conn, projection, instance_id, cursors)
    }

    fn savepoint(&mut self, name: &str) -> Result<()> {
        Self::check_savepoint_name(name)?;
        self.conn
            .execute_batch(&format!("SAVEPOINT {}", name))
            .map_err(db_err)
    }

    fn release_savepoint(&mut self, name: &str) -> Result<()> {
        Self::check_savepoint_name(name)?;
        self.conn
            .execute_batch(&format!("RELEASE SAVEPOINT {}", name))
            .map_err(db_err)
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        Self::check_savepoint_name(name)?;
        // ROLLBACK TO keeps the savepoint on the stack, release it as well
        self.conn
            .execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}",
                name = name
            ))
            .map_err(db_err)
    }

    fn record_failure(
        &mut self,
        projection: &str,
        instance_id: &str,
        sequence: Sequence,
        error: &str,
    ) -> Result<u32> {
        failed::record(&self.conn, projection, instance_id, sequence, error)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        if self.in_txn {
            self.conn.execute_batch("COMMIT").map_err(db_err)?;
            self.in_txn = false;
        }
        Ok(())
    }

    fn rollback(mut self: Box<Self>) {
        if self.in_txn {
            let _ = self.conn.execute_batch("ROLLBACK");
            self.in_txn = false;
        }
    }
}

impl<'a> Drop for SqliteProjectionTxn<'a> {
    fn drop(&mut self) {
        if self.in_txn {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

use std::collections::HashMap;

use crate::error::Result;
use crate::statement::Value;
use crate::types::{AggregateType, Cursor, FailedEvent, Sequence};

/// Runs parameterized SQL against the target store
pub trait Executor {
    /// Execute one statement, returning the number of affected rows
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize>;
}

/// Transaction over the projection tables and the cursor/failure
/// bookkeeping of one store
///
/// Note: Not required to be Send, as some backends hold a connection guard
pub trait ProjectionTxn: Executor {
    /// Read the cursors of `aggregate_types` for a projection instance and
    /// keep them locked until commit. Missing cursors read as 0.
    fn lock_cursors(
        &mut self,
        projection: &str,
        instance_id: &str,
        aggregate_types: &[AggregateType],
    ) -> Result<HashMap<AggregateType, Sequence>>;

    /// Upsert all given cursors
    fn update_cursors(
        &mut self,
        projection: &str,
        instance_id: &str,
        cursors: &HashMap<AggregateType, Sequence>,
    ) -> Result<()>;

    fn savepoint(&mut self, name: &str) -> Result<()>;

    fn release_savepoint(&mut self, name: &str) -> Result<()>;

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<()>;

    /// Increment the failure counter of an event and return the new count
    fn record_failure(
        &mut self,
        projection: &str,
        instance_id: &str,
        sequence: Sequence,
        error: &str,
    ) -> Result<u32>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>);
}

/// Store holding the projection tables, cursors and failed events
pub trait ProjectionStore: Send + Sync {
    type Txn<'a>: ProjectionTxn
    where
        Self: 'a;

    /// Begin a write transaction
    fn begin_txn(&self) -> Result<Self::Txn<'_>>;

    /// All cursors of a projection for one instance
    fn cursors(&self, projection: &str, instance_id: &str) -> Result<Vec<Cursor>>;

    /// Failure bookkeeping of a projection, most recent first
    fn failed_events(&self, projection: &str) -> Result<Vec<FailedEvent>>;

    /// Run idempotent DDL (`CREATE TABLE IF NOT EXISTS ...`) for the
    /// projection's tables
    fn execute_ddl(&self, ddl: &[String]) -> Result<()>;
}

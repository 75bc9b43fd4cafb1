//! SQLite backend for the strata projection engine
//!
//! Provides:
//! - [`SqliteStore`]: projection tables, per-aggregate-type cursors, failed
//!   event bookkeeping and instance leases
//! - [`SqliteEventLog`]: a reference event log with global sequences that
//!   publishes appended events on an event bus
//!
//! Statements run inside `BEGIN IMMEDIATE` transactions with one savepoint
//! per statement, so a failing statement never discards the applied prefix.

mod codec;
pub mod cursor;
pub mod event_log;
pub mod failed;
pub mod lease;
pub mod schema;
pub mod store;
pub mod txn;

pub use event_log::SqliteEventLog;
pub use store::SqliteStore;
pub use txn::SqliteProjectionTxn;

//! Strata Core: types and traits of the strata projection engine
//!
//! Every queryable view of an event-sourced system is a projection rebuilt
//! from the event log. This crate defines the pieces shared by the engine and
//! its storage backends:
//! - Events and the event log collaborator interface
//! - Statements: row mutations with ordering metadata
//! - Reducers: event → statements, with typed event kinds
//! - Store traits for cursors, failed events and leases
//! - Configuration and error types

pub mod config;
pub mod error;
pub mod event_log;
pub mod observe;
pub mod reducer;
pub mod statement;
pub mod traits;
pub mod types;

pub use config::{ProjectionConfig, StoreConfig, SynchronousMode};
pub use error::{Result, StrataError};
pub use event_log::{AggregateFilter, EventLog, EventQuery, InstanceQuery};
pub use reducer::{EventKind, Reduce, Reducer, ReducerSet, TypedReducer};
pub use statement::{
    Action, Column, ColumnOp, Condition, CopySource, Operation, Statement, Value,
};
pub use traits::{Executor, LeaseStore, ProjectionStore, ProjectionTxn};
pub use types::{
    AggregateType, Cursor, Event, EventType, FailedEvent, LeaseInfo, NewEvent, Sequence,
};

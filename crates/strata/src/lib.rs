//! Strata: an event-sourced projection engine
//!
//! Every queryable view of an event-sourced system is a projection rebuilt
//! incrementally from the event log. Strata keeps projections current and
//! consistent while many workers run side by side:
//! - **Statements**: row mutations derived from one event, ordered by the
//!   previous sequence of their aggregate type
//! - **Pusher**: applies statements in one transaction with a savepoint per
//!   event and advances per-aggregate-type cursors
//! - **Leases**: a fencing token per projection and instance, renewed in the
//!   background
//! - **Subscriber**: low-latency live path fed by the event bus
//! - **Scheduler**: lease-protected bulk catch-up, so no event is missed
//! - **Failure escalation**: a poisoned event is retried up to a threshold,
//!   then skipped with an audit record
//!
//! # Quick Start
//!
//! ```no_run
//! use strata::prelude::*;
//!
//! struct Users;
//!
//! impl Reducer for Users {
//!     fn aggregate_type(&self) -> AggregateType {
//!         "user".into()
//!     }
//!
//!     fn reduce(&self, event: &Event) -> Result<Vec<Statement>> {
//!         Ok(vec![Statement::create(
//!             event,
//!             "users",
//!             vec![Column::new("id", event.aggregate_id.as_str())],
//!         )?])
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let engine = Engine::open("./data")?;
//! let reducers = ReducerSet::new()
//!     .with(Users)
//!     .with_table("CREATE TABLE IF NOT EXISTS users (id TEXT PRIMARY KEY)");
//! let projection = engine.projection("users", reducers, ProjectionConfig::default())?;
//!
//! engine.push(NewEvent::new("tenant-1", "user", "u1", "user.added"))?;
//! projection
//!     .trigger(&CancellationToken::new(), &["tenant-1".to_string()])
//!     .await?;
//!
//! let handle = projection.project(CancellationToken::new())?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod prelude;

pub use strata_core::{
    config::{ProjectionConfig, StoreConfig, SynchronousMode},
    error::{Result, StrataError},
    event_log::{AggregateFilter, EventLog, EventQuery, InstanceQuery},
    reducer::{EventKind, Reduce, Reducer, ReducerSet, TypedReducer},
    statement::{
        Action, Column, ColumnOp, Condition, CopySource, Operation, Statement, Value,
    },
    traits::{Executor, LeaseStore, ProjectionStore, ProjectionTxn},
    types::{AggregateType, Cursor, Event, EventType, FailedEvent, LeaseInfo, NewEvent, Sequence},
};

pub use strata_bus::{BusError, EventBus, Subscription};
pub use strata_projector::{
    cancel_on_err, Halt, Lease, Projection, ProjectionHandle, PushOutcome, Pusher, TickReport,
    MILESTONE_AGGREGATE_TYPE, MILESTONE_FIRST_RUN,
};
pub use strata_sqlite::{SqliteEventLog, SqliteStore};

pub use engine::{Engine, SqliteProjection};

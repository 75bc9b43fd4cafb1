//! Strata Prelude
//!
//! Import this to get all commonly used types and traits:
//!
//! ```
//! use strata::prelude::*;
//! ```

// Core types
pub use crate::{
    AggregateType, Cursor, Event, EventType, FailedEvent, NewEvent, Result, Sequence, StrataError,
};

// Configs
pub use crate::{ProjectionConfig, StoreConfig, SynchronousMode};

// Statements and reducers
pub use crate::{
    Action, Column, Condition, EventKind, Reduce, Reducer, ReducerSet, Statement, TypedReducer,
    Value,
};

// Traits
pub use crate::{EventLog, LeaseStore, ProjectionStore};

// Engine
pub use crate::{Engine, EventBus, Projection, ProjectionHandle, SqliteProjection, TickReport};

// Re-export common external deps
pub use anyhow;
pub use serde::{Deserialize, Serialize};
pub use std::sync::Arc;
pub use tokio_util::sync::CancellationToken;
pub use tracing;

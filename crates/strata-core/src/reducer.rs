//! Reducers turn events into statements
//!
//! A projection owns one [`ReducerSet`] with at most one [`Reducer`] per
//! aggregate type. Reducers are pure: the same event always yields the same
//! statements, which is what lets the scheduler re-reduce a range after a
//! failed push.
//!
//! Most reducers are written against a typed enum of event kinds:
//!
//! ```ignore
//! enum UserEvent { Added(UserAdded), Removed }
//!
//! impl EventKind for UserEvent {
//!     fn aggregate_type() -> AggregateType { "user".into() }
//!     fn decode(event: &Event) -> Result<Option<Self>> {
//!         Ok(match event.event_type.as_str() {
//!             "user.added" => Some(UserEvent::Added(event.payload_as()?)),
//!             "user.removed" => Some(UserEvent::Removed),
//!             _ => None,
//!         })
//!     }
//! }
//!
//! impl Reduce<UserEvent> for UserProjection {
//!     fn reduce(&self, event: &Event, kind: UserEvent) -> Result<Vec<Statement>> {
//!         match kind {
//!             UserEvent::Added(a) => ...,
//!             UserEvent::Removed => ...,
//!         }
//!     }
//! }
//!
//! let set = ReducerSet::new().with(TypedReducer::new(UserProjection));
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::statement::Statement;
use crate::types::{AggregateType, Event};

/// Reduces the events of one aggregate type
pub trait Reducer: Send + Sync {
    fn aggregate_type(&self) -> AggregateType;

    /// Statements for `event`. An empty result is treated as a no-op so the
    /// cursor still advances past the event.
    fn reduce(&self, event: &Event) -> Result<Vec<Statement>>;
}

/// Typed variants of the events of one aggregate type
pub trait EventKind: Sized {
    fn aggregate_type() -> AggregateType;

    /// Decode an event; `Ok(None)` for event types the projection ignores
    fn decode(event: &Event) -> Result<Option<Self>>;
}

/// Reduce a decoded event kind
pub trait Reduce<E: EventKind>: Send + Sync {
    fn reduce(&self, event: &Event, kind: E) -> Result<Vec<Statement>>;
}

/// Adapts a [`Reduce`] implementation to [`Reducer`]
pub struct TypedReducer<E, R> {
    inner: R,
    _kind: PhantomData<fn() -> E>,
}

impl<E, R> TypedReducer<E, R>
where
    E: EventKind,
    R: Reduce<E>,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            _kind: PhantomData,
        }
    }
}

impl<E, R> Reducer for TypedReducer<E, R>
where
    E: EventKind,
    R: Reduce<E>,
{
    fn aggregate_type(&self) -> AggregateType {
        E::aggregate_type()
    }

    fn reduce(&self, event: &Event) -> Result<Vec<Statement>> {
        match E::decode(event)? {
            Some(kind) => self.inner.reduce(event, kind),
            None => Ok(vec![Statement::no_op(event)?]),
        }
    }
}

/// The reducers and table definitions of one projection
#[derive(Clone, Default)]
pub struct ReducerSet {
    reducers: BTreeMap<AggregateType, Arc<dyn Reducer>>,
    ddl: Vec<String>,
    /// Aggregate types registered more than once through [`ReducerSet::with`]
    duplicates: Vec<AggregateType>,
}

impl ReducerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reducer
    ///
    /// A second reducer for an aggregate type is dropped and reported by
    /// [`ReducerSet::validate`].
    pub fn with<R: Reducer + 'static>(mut self, reducer: R) -> Self {
        let aggregate_type = reducer.aggregate_type();
        if self.try_register(Arc::new(reducer)).is_err() {
            self.duplicates.push(aggregate_type);
        }
        self
    }

    /// Add idempotent DDL for the projection's tables
    pub fn with_table(mut self, ddl: impl Into<String>) -> Self {
        self.ddl.push(ddl.into());
        self
    }

    /// Try to register a reducer, returning error if already registered
    pub fn try_register(&mut self, reducer: Arc<dyn Reducer>) -> Result<()> {
        let aggregate_type = reducer.aggregate_type();
        if self.reducers.contains_key(&aggregate_type) {
            return Err(StrataError::InvalidState(format!(
                "Reducer for aggregate type '{}' already registered",
                aggregate_type
            )));
        }
        self.reducers.insert(aggregate_type, reducer);
        Ok(())
    }

    /// Fails with [`StrataError::Config`] if [`ReducerSet::with`] was given
    /// two reducers for one aggregate type
    pub fn validate(&self) -> Result<()> {
        if self.duplicates.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = self.duplicates.iter().map(|t| t.as_str()).collect();
        Err(StrataError::Config(format!(
            "more than one reducer for aggregate types: {}",
            names.join(", ")
        )))
    }

    pub fn aggregate_types(&self) -> Vec<AggregateType> {
        self.reducers.keys().cloned().collect()
    }

    pub fn ddl(&self) -> &[String] {
        &self.ddl
    }

    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }

    /// Reduce one event with the reducer of its aggregate type.
    ///
    /// Events without a reducer and reducers returning nothing yield a
    /// single no-op statement. Reducer failures are reported as
    /// [`StrataError::Reduce`], except ordering errors which keep their own
    /// variant.
    pub fn reduce(&self, event: &Event) -> Result<Vec<Statement>> {
        let Some(reducer) = self.reducers.get(&event.aggregate_type) else {
            return Ok(vec![Statement::no_op(event)?]);
        };

        let statements = reducer.reduce(event).map_err(|e| match e {
            e @ (StrataError::Reduce { .. } | StrataError::PrevSeqGreaterOrEqual { .. }) => e,
            other => StrataError::Reduce {
                event_type: event.event_type.to_string(),
                sequence: event.sequence,
                message: other.to_string(),
            },
        })?;

        if statements.is_empty() {
            return Ok(vec![Statement::no_op(event)?]);
        }
        Ok(statements)
    }
}

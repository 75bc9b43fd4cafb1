//! Event log collaborator interface
//!
//! The projection engine reads from, but never owns, the durable event log.
//! Backends implement [`EventLog`]; live delivery is provided separately by
//! an event bus the log publishes to after every append.

use crate::error::Result;
use crate::types::{AggregateType, Event, NewEvent, Sequence};

/// Events of one aggregate type newer than a cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFilter {
    pub aggregate_type: AggregateType,
    pub sequence_greater_than: Sequence,
}

/// Query for [`EventLog::filter`]. Results are ordered by ascending
/// sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    pub aggregates: Vec<AggregateFilter>,
    /// Empty means all instances
    pub instance_ids: Vec<String>,
    /// Zero means unlimited
    pub limit: usize,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(mut self, aggregate_type: impl Into<AggregateType>, after: Sequence) -> Self {
        self.aggregates.push(AggregateFilter {
            aggregate_type: aggregate_type.into(),
            sequence_greater_than: after,
        });
        self
    }

    pub fn instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_ids.push(instance_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Query for active instance discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceQuery {
    /// Only instances that have events of one of these aggregate types
    pub aggregate_types: Vec<AggregateType>,
    /// Instances to leave out (e.g. the system instance)
    pub exclude: Vec<String>,
}

/// Durable, append-only event log partitioned by instance
pub trait EventLog: Send + Sync {
    /// Events matching `query`, ordered by sequence
    fn filter(&self, query: &EventQuery) -> Result<Vec<Event>>;

    /// Append one event and return it with its assigned sequences
    fn push(&self, event: NewEvent) -> Result<Event>;

    /// Ids of instances that have events
    fn instance_ids(&self, query: &InstanceQuery) -> Result<Vec<String>>;
}

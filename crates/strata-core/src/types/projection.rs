use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::{AggregateType, Sequence};

/// Last applied sequence of a projection for one aggregate type of one
/// instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub projection_name: String,
    pub aggregate_type: AggregateType,
    pub instance_id: String,
    pub sequence: Sequence,
    pub updated_at: DateTime<Utc>,
}

/// Retry bookkeeping for an event whose statement failed to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub projection_name: String,
    pub failed_sequence: Sequence,
    pub instance_id: String,
    pub failure_count: u32,
    pub error: String,
    pub last_failed: DateTime<Utc>,
}

/// Lease row as persisted by the lease store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub projection_name: String,
    pub instance_id: String,
    pub locker_id: String,
    pub locked_until: DateTime<Utc>,
}

impl LeaseInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until < now
    }
}

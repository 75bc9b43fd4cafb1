use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, StrataError};

/// Sequence number assigned by the event log. Strictly increasing per
/// aggregate; zero means "nothing applied yet".
pub type Sequence = u64;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype!(
    /// Kind of aggregate an event belongs to (e.g. `user`, `org`)
    AggregateType
);

string_newtype!(
    /// Type of an event (e.g. `user.added`)
    EventType
);

/// One committed fact read from the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub instance_id: String,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub sequence: Sequence,
    /// Sequence of the previous event of the same aggregate (0 if first)
    pub previous_aggregate_sequence: Sequence,
    /// Sequence of the previous event of the same aggregate type within the
    /// same instance (0 if first). Cursors are tracked per aggregate type,
    /// so this is the value statements are ordered against.
    pub previous_aggregate_type_sequence: Sequence,
    pub event_type: EventType,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    /// Deserialize the payload into a typed struct
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| StrataError::Reduce {
            event_type: self.event_type.to_string(),
            sequence: self.sequence,
            message: e.to_string(),
        })
    }
}

/// An event to be appended; sequences are assigned by the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub instance_id: String,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub event_type: EventType,
    pub creator: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(
        instance_id: impl Into<String>,
        aggregate_type: impl Into<AggregateType>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<EventType>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            creator: String::new(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }
}

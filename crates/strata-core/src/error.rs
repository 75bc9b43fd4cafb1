use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A reducer produced a statement whose sequence does not follow its
    /// previous sequence. Never retried.
    #[error("previous sequence {previous_sequence} is greater or equal to sequence {sequence}")]
    PrevSeqGreaterOrEqual {
        sequence: u64,
        previous_sequence: u64,
    },

    #[error(
        "sequence gap on {aggregate_type}: cursor at {cursor}, statement {sequence} expects {previous_sequence}"
    )]
    SequenceGap {
        aggregate_type: String,
        cursor: u64,
        sequence: u64,
        previous_sequence: u64,
    },

    #[error("statement {sequence} failed ({failure_count} failures): {message}")]
    StatementFailed {
        sequence: u64,
        failure_count: u32,
        message: String,
    },

    #[error("{pending} statements were not applied")]
    SomeStatementsUnapplied { pending: usize },

    #[error("statement has no table")]
    NoTable,

    #[error("statement has no values")]
    NoValues,

    #[error("statement has no conditions")]
    NoCondition,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Event log filter error: {0}")]
    Filter(String),

    #[error("reduce of {event_type} at sequence {sequence} failed: {message}")]
    Reduce {
        event_type: String,
        sequence: u64,
        message: String,
    },

    #[error("Event bus error: {0}")]
    Bus(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl StrataError {
    /// Whether the background loops may retry the failed operation on a
    /// later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StrataError::SequenceGap { .. }
                | StrataError::SomeStatementsUnapplied { .. }
                | StrataError::StatementFailed { .. }
                | StrataError::Lock(_)
                | StrataError::Filter(_)
                | StrataError::Database(_)
                | StrataError::Cancelled
        )
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

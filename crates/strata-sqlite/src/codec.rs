//! Conversions between strata values and SQLite storage

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use strata_core::{Result, StrataError, Value};

pub(crate) fn db_err(e: rusqlite::Error) -> StrataError {
    StrataError::Database(e.to_string())
}

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

/// Fixed-width UTC timestamps, so text comparison in SQL orders them
/// chronologically
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StrataError::Serialization(format!("invalid timestamp '{}': {}", s, e)))
}

/// SQLite integers are signed; sequences above `i64::MAX` cannot be stored
pub(crate) fn to_i64(sequence: u64) -> Result<i64> {
    i64::try_from(sequence).map_err(|_| {
        StrataError::Serialization(format!("sequence {} exceeds the storage range", sequence))
    })
}

pub(crate) fn from_i64(sequence: i64) -> Result<u64> {
    u64::try_from(sequence)
        .map_err(|_| StrataError::Serialization(format!("negative sequence {} in store", sequence)))
}

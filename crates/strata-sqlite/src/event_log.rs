//! Reference event log on SQLite
//!
//! Sequences are global and assigned on append. Every appended event is
//! published on the attached [`EventBus`] after its transaction commits.

use chrono::{SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use strata_bus::EventBus;
use strata_core::{
    Event, EventLog, EventQuery, InstanceQuery, NewEvent, Result, StoreConfig, StrataError,
};

use crate::codec::{db_err, format_ts, from_i64, parse_ts, to_i64};
use crate::schema;
use crate::store::open_connection;

const EVENT_COLUMNS: &str = "sequence, instance_id, aggregate_type, aggregate_id,
    previous_aggregate_sequence, previous_aggregate_type_sequence, event_type, creator,
    created_at, payload";

pub struct SqliteEventLog {
    conn: Mutex<Connection>,
    bus: Option<EventBus>,
}

impl SqliteEventLog {
    /// Open the log on its own connection to the configured database
    pub fn open(cfg: &StoreConfig) -> Result<Self> {
        let conn = open_connection(cfg)?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            bus: None,
        })
    }

    /// Publish appended events on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn bus(&self) -> Option<&EventBus> {
        self.bus.as_ref()
    }

    /// Append several events in one transaction
    pub fn push_all(&self, events: Vec<NewEvent>) -> Result<Vec<Event>> {
        let appended = {
            let mut conn = self.conn.lock();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let mut appended = Vec::with_capacity(events.len());
            for event in events {
                appended.push(append(&tx, event)?);
            }
            tx.commit().map_err(db_err)?;
            appended
        };

        if let Some(bus) = &self.bus {
            for event in &appended {
                if let Err(e) = bus.publish(event) {
                    tracing::warn!(sequence = event.sequence, error = %e, "failed to publish event");
                }
            }
        }
        Ok(appended)
    }

    /// Highest assigned sequence, 0 for an empty log
    pub fn latest_sequence(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let latest: Option<i64> = conn
            .query_row("SELECT MAX(sequence) FROM events", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(latest.map(from_i64).transpose()?.unwrap_or(0))
    }
}

fn append(conn: &Connection, event: NewEvent) -> Result<Event> {
    let latest: Option<i64> = conn
        .query_row("SELECT MAX(sequence) FROM events", [], |row| row.get(0))
        .map_err(db_err)?;
    let sequence = latest.map(from_i64).transpose()?.unwrap_or(0) + 1;

    let previous_aggregate_sequence: Option<i64> = conn
        .query_row(
            "SELECT MAX(sequence) FROM events
             WHERE instance_id = ?1 AND aggregate_type = ?2 AND aggregate_id = ?3",
            params![
                event.instance_id,
                event.aggregate_type.as_str(),
                event.aggregate_id
            ],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?
        .flatten();

    let previous_aggregate_type_sequence: Option<i64> = conn
        .query_row(
            "SELECT MAX(sequence) FROM events WHERE instance_id = ?1 AND aggregate_type = ?2",
            params![event.instance_id, event.aggregate_type.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?
        .flatten();

    let appended = Event {
        instance_id: event.instance_id,
        aggregate_type: event.aggregate_type,
        aggregate_id: event.aggregate_id,
        sequence,
        previous_aggregate_sequence: previous_aggregate_sequence
            .map(from_i64)
            .transpose()?
            .unwrap_or(0),
        previous_aggregate_type_sequence: previous_aggregate_type_sequence
            .map(from_i64)
            .transpose()?
            .unwrap_or(0),
        event_type: event.event_type,
        creator: event.creator,
        // stored with microsecond precision
        created_at: Utc::now().trunc_subsecs(6),
        payload: event.payload,
    };

    conn.execute(
        &format!(
            "INSERT INTO events ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            EVENT_COLUMNS
        ),
        params![
            to_i64(appended.sequence)?,
            appended.instance_id,
            appended.aggregate_type.as_str(),
            appended.aggregate_id,
            to_i64(appended.previous_aggregate_sequence)?,
            to_i64(appended.previous_aggregate_type_sequence)?,
            appended.event_type.as_str(),
            appended.creator,
            format_ts(appended.created_at),
            serde_json::to_string(&appended.payload)?,
        ],
    )
    .map_err(db_err)?;

    Ok(appended)
}

struct EventRow {
    sequence: i64,
    instance_id: String,
    aggregate_type: String,
    aggregate_id: String,
    previous_aggregate_sequence: i64,
    previous_aggregate_type_sequence: i64,
    event_type: String,
    creator: String,
    created_at: String,
    payload: String,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            instance_id: row.get(1)?,
            aggregate_type: row.get(2)?,
            aggregate_id: row.get(3)?,
            previous_aggregate_sequence: row.get(4)?,
            previous_aggregate_type_sequence: row.get(5)?,
            event_type: row.get(6)?,
            creator: row.get(7)?,
            created_at: row.get(8)?,
            payload: row.get(9)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        Ok(Event {
            instance_id: self.instance_id,
            aggregate_type: self.aggregate_type.into(),
            aggregate_id: self.aggregate_id,
            sequence: from_i64(self.sequence)?,
            previous_aggregate_sequence: from_i64(self.previous_aggregate_sequence)?,
            previous_aggregate_type_sequence: from_i64(self.previous_aggregate_type_sequence)?,
            event_type: self.event_type.into(),
            creator: self.creator,
            created_at: parse_ts(&self.created_at)?,
            payload: serde_json::from_str(&self.payload)?,
        })
    }
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

impl EventLog for SqliteEventLog {
    fn filter(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let mut sql = format!("SELECT {} FROM events", EVENT_COLUMNS);
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if !query.aggregates.is_empty() {
            let mut ors = Vec::with_capacity(query.aggregates.len());
            for filter in &query.aggregates {
                values.push(SqlValue::Text(filter.aggregate_type.to_string()));
                values.push(SqlValue::Integer(to_i64(filter.sequence_greater_than)?));
                ors.push(format!(
                    "(aggregate_type = ?{} AND sequence > ?{})",
                    values.len() - 1,
                    values.len()
                ));
            }
            clauses.push(format!("({})", ors.join(" OR ")));
        }

        if !query.instance_ids.is_empty() {
            let start = values.len() + 1;
            values.extend(query.instance_ids.iter().cloned().map(SqlValue::Text));
            clauses.push(format!(
                "instance_id IN ({})",
                placeholders(start, query.instance_ids.len())
            ));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY sequence");
        if query.limit > 0 {
            values.push(SqlValue::Integer(query.limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StrataError::Filter(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(values), EventRow::from_row)
            .map_err(|e| StrataError::Filter(e.to_string()))?;

        let mut events = Vec::new();
        for row in rows {
            let row = row.map_err(|e| StrataError::Filter(e.to_string()))?;
            events.push(row.into_event()?);
        }
        Ok(events)
    }

    fn push(&self, event: NewEvent) -> Result<Event> {
        let mut appended = self.push_all(vec![event])?;
        appended
            .pop()
            .ok_or_else(|| StrataError::InvalidState("append returned no event".into()))
    }

    fn instance_ids(&self, query: &InstanceQuery) -> Result<Vec<String>> {
        let mut sql = String::from("SELECT DISTINCT instance_id FROM events");
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if !query.aggregate_types.is_empty() {
            let start = values.len() + 1;
            values.extend(
                query
                    .aggregate_types
                    .iter()
                    .map(|t| SqlValue::Text(t.to_string())),
            );
            clauses.push(format!(
                "aggregate_type IN ({})",
                placeholders(start, query.aggregate_types.len())
            ));
        }
        if !query.exclude.is_empty() {
            let start = values.len() + 1;
            values.extend(query.exclude.iter().cloned().map(SqlValue::Text));
            clauses.push(format!(
                "instance_id NOT IN ({})",
                placeholders(start, query.exclude.len())
            ));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY instance_id");

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StrataError::Filter(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| row.get::<_, String>(0))
            .map_err(|e| StrataError::Filter(e.to_string()))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StrataError::Filter(e.to_string()))
    }
}

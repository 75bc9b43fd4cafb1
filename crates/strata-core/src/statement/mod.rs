//! Statements: row mutations derived from one event, plus the ordering
//! metadata the pusher needs to apply them exactly once.

pub mod action;
pub mod sql;
pub mod value;

pub use action::{Action, Column, ColumnOp, Condition, CopySource, ExecFn, Operation};
pub use sql::SqlStatement;
pub use value::Value;

use chrono::{DateTime, Utc};

use crate::error::{Result, StrataError};
use crate::traits::Executor;
use crate::types::{AggregateType, Event, Sequence};

/// One row mutation derived from an event
#[derive(Debug, Clone)]
pub struct Statement {
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub instance_id: String,
    pub sequence: Sequence,
    pub previous_sequence: Sequence,
    pub created_at: DateTime<Utc>,
    action: Action,
}

/// Fails with `PrevSeqGreaterOrEqual` unless `sequence > previous_sequence`
pub fn check_ordering(sequence: Sequence, previous_sequence: Sequence) -> Result<()> {
    if previous_sequence >= sequence {
        return Err(StrataError::PrevSeqGreaterOrEqual {
            sequence,
            previous_sequence,
        });
    }
    Ok(())
}

impl Statement {
    /// Build a statement for `event`. Its previous sequence is the previous
    /// sequence of the event's aggregate type, which is what cursors track.
    pub fn new(event: &Event, action: Action) -> Result<Self> {
        check_ordering(event.sequence, event.previous_aggregate_type_sequence)?;
        Ok(Self {
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            instance_id: event.instance_id.clone(),
            sequence: event.sequence,
            previous_sequence: event.previous_aggregate_type_sequence,
            created_at: event.created_at,
            action,
        })
    }

    /// Build a statement from raw ordering metadata
    pub fn from_parts(
        aggregate_type: impl Into<AggregateType>,
        instance_id: impl Into<String>,
        sequence: Sequence,
        previous_sequence: Sequence,
        action: Action,
    ) -> Result<Self> {
        check_ordering(sequence, previous_sequence)?;
        Ok(Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: String::new(),
            instance_id: instance_id.into(),
            sequence,
            previous_sequence,
            created_at: Utc::now(),
            action,
        })
    }

    pub fn no_op(event: &Event) -> Result<Self> {
        Self::new(event, Action::NoOp)
    }

    pub fn create(event: &Event, table: impl Into<String>, columns: Vec<Column>) -> Result<Self> {
        Self::new(event, Action::create(table, columns))
    }

    pub fn upsert(
        event: &Event,
        table: impl Into<String>,
        conflict_columns: Vec<String>,
        columns: Vec<Column>,
    ) -> Result<Self> {
        Self::new(event, Action::upsert(table, conflict_columns, columns))
    }

    pub fn update(
        event: &Event,
        table: impl Into<String>,
        values: Vec<Column>,
        conditions: Vec<Condition>,
    ) -> Result<Self> {
        Self::new(event, Action::update(table, values, conditions))
    }

    pub fn delete(
        event: &Event,
        table: impl Into<String>,
        conditions: Vec<Condition>,
    ) -> Result<Self> {
        Self::new(event, Action::delete(table, conditions))
    }

    pub fn copy(
        event: &Event,
        table: impl Into<String>,
        conflict_columns: Vec<String>,
        from: Vec<CopySource>,
        to: Vec<String>,
        conditions: Vec<Condition>,
    ) -> Result<Self> {
        Self::new(
            event,
            Action::copy(table, conflict_columns, from, to, conditions),
        )
    }

    pub fn multi(event: &Event, actions: Vec<Action>) -> Result<Self> {
        Self::new(event, Action::Multi(actions))
    }

    pub fn exec<F>(event: &Event, f: F) -> Result<Self>
    where
        F: Fn(&mut dyn Executor) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(event, Action::exec(f))
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn operation(&self) -> Operation {
        self.action.operation()
    }

    pub fn table(&self) -> Option<&str> {
        self.action.table()
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self.action, Action::NoOp)
    }

    pub fn execute(&self, executor: &mut dyn Executor) -> Result<()> {
        self.action.execute(executor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: u64, previous: u64) -> Event {
        Event {
            instance_id: "inst".into(),
            aggregate_type: "user".into(),
            aggregate_id: "u1".into(),
            sequence,
            previous_aggregate_sequence: 0,
            previous_aggregate_type_sequence: previous,
            event_type: "user.added".into(),
            creator: String::new(),
            created_at: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<(String, usize)>,
    }

    impl Executor for Recorder {
        fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
            self.calls.push((sql.to_string(), params.len()));
            Ok(1)
        }
    }

    #[test]
    fn test_ordering_rejects_greater_or_equal_previous() {
        for (seq, prev) in [(1, 1), (1, 2), (0, 0), (5, 9)] {
            let err = Statement::no_op(&event(seq, prev)).unwrap_err();
            assert!(
                matches!(err, StrataError::PrevSeqGreaterOrEqual { .. }),
                "seq {} prev {}",
                seq,
                prev
            );
        }
        assert!(Statement::no_op(&event(2, 1)).is_ok());
        assert!(Statement::from_parts("user", "inst", 3, 3, Action::NoOp).is_err());
    }

    #[test]
    fn test_statement_copies_event_metadata() {
        let stmt = Statement::create(&event(4, 2), "users", vec![Column::new("id", "u1")]).unwrap();
        assert_eq!(stmt.sequence, 4);
        assert_eq!(stmt.previous_sequence, 2);
        assert_eq!(stmt.instance_id, "inst");
        assert_eq!(stmt.operation(), Operation::Create);
        assert_eq!(stmt.table(), Some("users"));
        assert!(!stmt.is_no_op());
    }

    #[test]
    fn test_no_op_executes_nothing() {
        let mut rec = Recorder::default();
        Statement::no_op(&event(1, 0))
            .unwrap()
            .execute(&mut rec)
            .unwrap();
        assert!(rec.calls.is_empty());
    }

    #[test]
    fn test_multi_executes_in_order() {
        let stmt = Statement::multi(
            &event(2, 1),
            vec![
                Action::delete("members", vec![Condition::eq("user_id", "u1")]),
                Action::NoOp,
                Action::update(
                    "orgs",
                    vec![Column::new("member_count", 0i64)],
                    vec![Condition::eq("id", "o1")],
                ),
            ],
        )
        .unwrap();
        let mut rec = Recorder::default();
        stmt.execute(&mut rec).unwrap();
        assert_eq!(rec.calls.len(), 2);
        assert!(rec.calls[0].0.starts_with("DELETE FROM members"));
        assert!(rec.calls[1].0.starts_with("UPDATE orgs"));
    }

    #[test]
    fn test_exec_runs_closure() {
        let stmt = Statement::exec(&event(2, 1), |ex| {
            ex.execute("DELETE FROM sessions", &[])?;
            Ok(())
        })
        .unwrap();
        let mut rec = Recorder::default();
        stmt.execute(&mut rec).unwrap();
        assert_eq!(rec.calls, vec![("DELETE FROM sessions".to_string(), 0)]);
    }

    #[test]
    fn test_invalid_action_fails_at_execution() {
        let stmt = Statement::update(&event(2, 1), "users", vec![], vec![]).unwrap();
        let mut rec = Recorder::default();
        assert!(matches!(
            stmt.execute(&mut rec),
            Err(StrataError::NoValues)
        ));
    }
}

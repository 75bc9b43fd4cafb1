//! Transactional batch apply
//!
//! A push runs in one store transaction:
//! 1. lock the cursors of every aggregate type in the batch
//! 2. sort statements by sequence
//! 3. skip what the cursor already covers, stop at the first gap
//! 4. execute each event's statements inside a savepoint, escalating
//!    failures
//! 5. write the advanced cursors and commit
//!
//! Cancellation is checked between events. The applied prefix is always
//! committed and the rest is handed back as pending.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use strata_core::{
    observe, AggregateType, ProjectionStore, ProjectionTxn, Result, Sequence, Statement,
    StrataError,
};
use tokio_util::sync::CancellationToken;

use crate::escalation::{Escalation, EscalationAction};

/// Savepoint wrapped around the statements of one event
pub const SAVEPOINT: &str = "push_stmt";

/// Why a push stopped before the end of its batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    /// A statement does not follow the cursor of its aggregate type
    Gap {
        aggregate_type: AggregateType,
        cursor: Sequence,
        sequence: Sequence,
        previous_sequence: Sequence,
    },
    /// A statement failed below the skip threshold
    Failed {
        sequence: Sequence,
        failure_count: u32,
        message: String,
    },
    /// The cancellation token fired
    Cancelled,
}

/// Result of one push
#[derive(Debug, Default)]
pub struct PushOutcome {
    /// Statements executed and committed
    pub applied: usize,
    /// Statements already covered by the cursor
    pub already_applied: usize,
    /// Statements force-skipped after reaching the skip threshold
    pub skipped: usize,
    /// Cursors of the batch's aggregate types after the push
    pub cursors: HashMap<AggregateType, Sequence>,
    pub halt: Option<Halt>,
    /// Statements not applied because the push halted, in sequence order
    pub pending: Vec<Statement>,
}

impl PushOutcome {
    pub fn is_complete(&self) -> bool {
        self.halt.is_none()
    }

    /// Turn a halted push into its error
    pub fn into_result(self) -> Result<Self> {
        match &self.halt {
            None => Ok(self),
            Some(Halt::Gap {
                aggregate_type,
                cursor,
                sequence,
                previous_sequence,
            }) => Err(StrataError::SequenceGap {
                aggregate_type: aggregate_type.to_string(),
                cursor: *cursor,
                sequence: *sequence,
                previous_sequence: *previous_sequence,
            }),
            Some(Halt::Failed {
                sequence,
                failure_count,
                message,
            }) => Err(StrataError::StatementFailed {
                sequence: *sequence,
                failure_count: *failure_count,
                message: message.clone(),
            }),
            Some(Halt::Cancelled) => Err(StrataError::SomeStatementsUnapplied {
                pending: self.pending.len(),
            }),
        }
    }
}

/// Applies statements of one projection to its store
pub struct Pusher<'a, S: ProjectionStore> {
    store: &'a S,
    projection: &'a str,
    max_failure_count: u32,
}

impl<'a, S: ProjectionStore> Pusher<'a, S> {
    pub fn new(store: &'a S, projection: &'a str, max_failure_count: u32) -> Self {
        Self {
            store,
            projection,
            max_failure_count,
        }
    }

    /// Apply `statements` of one instance
    ///
    /// Returns an error only when the transaction itself fails, in which
    /// case nothing is committed. Gaps, failures below the skip threshold
    /// and cancellation are reported through [`PushOutcome::halt`].
    pub fn push(
        &self,
        token: &CancellationToken,
        mut statements: Vec<Statement>,
    ) -> Result<PushOutcome> {
        let Some(first) = statements.first() else {
            return Ok(PushOutcome::default());
        };
        let instance_id = first.instance_id.clone();
        if let Some(other) = statements.iter().find(|s| s.instance_id != instance_id) {
            return Err(StrataError::InvalidState(format!(
                "push batch mixes instances '{}' and '{}'",
                instance_id, other.instance_id
            )));
        }

        let start = Instant::now();
        // stable: statements of one event keep their order
        statements.sort_by_key(|s| s.sequence);

        let aggregate_types: Vec<AggregateType> = statements
            .iter()
            .map(|s| s.aggregate_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut txn = Box::new(self.store.begin_txn()?);
        let initial = txn.lock_cursors(self.projection, &instance_id, &aggregate_types)?;
        let mut cursors = initial.clone();
        let escalation = Escalation::new(self.projection, self.max_failure_count);
        let mut outcome = PushOutcome::default();

        let mut idx = 0;
        while idx < statements.len() {
            // statements sharing a sequence belong to one event
            let end = statements[idx..]
                .iter()
                .position(|s| {
                    s.sequence != statements[idx].sequence
                        || s.aggregate_type != statements[idx].aggregate_type
                })
                .map_or(statements.len(), |n| idx + n);
            let event = &statements[idx..end];
            let head = &event[0];
            let cursor = cursors.get(&head.aggregate_type).copied().unwrap_or(0);

            if head.sequence <= cursor {
                outcome.already_applied += event.len();
                idx = end;
                continue;
            }

            if token.is_cancelled() {
                tracing::debug!(
                    projection = self.projection,
                    instance = %instance_id,
                    pending = statements.len() - idx,
                    "push cancelled"
                );
                outcome.halt = Some(Halt::Cancelled);
                break;
            }

            if head.previous_sequence != 0 && head.previous_sequence != cursor {
                tracing::warn!(
                    projection = self.projection,
                    instance = %instance_id,
                    aggregate_type = %head.aggregate_type,
                    cursor,
                    sequence = head.sequence,
                    previous_sequence = head.previous_sequence,
                    "sequence gap, stopping push"
                );
                outcome.halt = Some(Halt::Gap {
                    aggregate_type: head.aggregate_type.clone(),
                    cursor,
                    sequence: head.sequence,
                    previous_sequence: head.previous_sequence,
                });
                break;
            }

            txn.savepoint(SAVEPOINT)?;
            let executed = event
                .iter()
                .try_for_each(|statement| statement.execute(txn.as_mut()));

            match executed {
                Ok(()) => {
                    txn.release_savepoint(SAVEPOINT)?;
                    cursors.insert(head.aggregate_type.clone(), head.sequence);
                    outcome.applied += event.len();
                }
                Err(err) => {
                    txn.rollback_to_savepoint(SAVEPOINT)?;
                    let escalated = escalation.escalate(txn.as_mut(), head, &err)?;
                    match escalated.action {
                        EscalationAction::Skip => {
                            cursors.insert(head.aggregate_type.clone(), head.sequence);
                            outcome.skipped += event.len();
                        }
                        EscalationAction::Halt => {
                            outcome.halt = Some(Halt::Failed {
                                sequence: head.sequence,
                                failure_count: escalated.failure_count,
                                message: err.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
            idx = end;
        }

        let advanced: HashMap<AggregateType, Sequence> = cursors
            .iter()
            .filter(|(aggregate_type, sequence)| {
                initial.get(*aggregate_type).copied().unwrap_or(0) < **sequence
            })
            .map(|(aggregate_type, sequence)| (aggregate_type.clone(), *sequence))
            .collect();
        if !advanced.is_empty() {
            txn.update_cursors(self.projection, &instance_id, &advanced)?;
        }
        txn.commit()?;

        if outcome.halt.is_some() {
            outcome.pending = statements.split_off(idx);
        }
        outcome.cursors = cursors;

        tracing::debug!(
            projection = self.projection,
            instance = %instance_id,
            applied = outcome.applied,
            already_applied = outcome.already_applied,
            skipped = outcome.skipped,
            pending = outcome.pending.len(),
            "push finished"
        );
        observe::record_push(self.projection, start.elapsed(), outcome.applied as u64);

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Action, Column, Condition, StoreConfig};
    use strata_sqlite::SqliteStore;
    use tempfile::TempDir;

    fn setup() -> (SqliteStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(StoreConfig::new(dir.path().join("strata.db"))).unwrap();
        store
            .execute_ddl(&[
                "CREATE TABLE IF NOT EXISTS users (id TEXT PRIMARY KEY, name TEXT NOT NULL)".into(),
            ])
            .unwrap();
        (store, dir)
    }

    fn create(seq: u64, prev: u64, id: &str) -> Statement {
        Statement::from_parts(
            "user",
            "inst",
            seq,
            prev,
            Action::create(
                "users",
                vec![Column::new("id", id), Column::new("name", format!("user {}", id))],
            ),
        )
        .unwrap()
    }

    fn rename(seq: u64, prev: u64, id: &str, name: &str) -> Statement {
        Statement::from_parts(
            "user",
            "inst",
            seq,
            prev,
            Action::update(
                "users",
                vec![Column::new("name", name)],
                vec![Condition::eq("id", id)],
            ),
        )
        .unwrap()
    }

    fn names(store: &SqliteStore) -> Vec<String> {
        let conn = store.conn().lock();
        let mut stmt = conn.prepare("SELECT name FROM users ORDER BY id").unwrap();
        let rows = stmt.query_map([], |row| row.get(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    fn cursor(store: &SqliteStore) -> u64 {
        store
            .cursors("users", "inst")
            .unwrap()
            .first()
            .map_or(0, |c| c.sequence)
    }

    #[test]
    fn test_applies_in_sequence_order() {
        let (store, _dir) = setup();
        let pusher = Pusher::new(&store, "users", 3);
        let outcome = pusher
            .push(
                &CancellationToken::new(),
                vec![rename(2, 1, "u1", "renamed"), create(1, 0, "u1")],
            )
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.cursors[&AggregateType::from("user")], 2);
        assert_eq!(names(&store), vec!["renamed"]);
        assert_eq!(cursor(&store), 2);
    }

    #[test]
    fn test_redelivery_is_ignored() {
        let (store, _dir) = setup();
        let pusher = Pusher::new(&store, "users", 3);
        let token = CancellationToken::new();
        pusher.push(&token, vec![create(1, 0, "u1")]).unwrap();

        let outcome = pusher.push(&token, vec![create(1, 0, "u1")]).unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.already_applied, 1);
        assert_eq!(outcome.applied, 0);
        assert!(store.failed_events("users").unwrap().is_empty());
    }

    #[test]
    fn test_gap_stops_batch() {
        let (store, _dir) = setup();
        let pusher = Pusher::new(&store, "users", 3);
        let outcome = pusher
            .push(
                &CancellationToken::new(),
                vec![create(1, 0, "u1"), rename(5, 3, "u1", "late")],
            )
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.pending.len(), 1);
        assert_eq!(outcome.pending[0].sequence, 5);
        assert!(matches!(
            outcome.halt,
            Some(Halt::Gap {
                cursor: 1,
                sequence: 5,
                ..
            })
        ));
        assert_eq!(cursor(&store), 1);
        assert!(matches!(
            outcome.into_result(),
            Err(StrataError::SequenceGap { .. })
        ));
    }

    #[test]
    fn test_failure_keeps_prefix() {
        let (store, _dir) = setup();
        let pusher = Pusher::new(&store, "users", 3);
        let outcome = pusher
            .push(
                &CancellationToken::new(),
                vec![create(1, 0, "u1"), create(2, 1, "u1"), create(3, 2, "u3")],
            )
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert!(matches!(
            outcome.halt,
            Some(Halt::Failed {
                sequence: 2,
                failure_count: 1,
                ..
            })
        ));
        assert_eq!(outcome.pending.len(), 2);
        assert_eq!(cursor(&store), 1);
        assert_eq!(store.failed_events("users").unwrap()[0].failed_sequence, 2);
    }

    #[test]
    fn test_cancelled_commits_prefix() {
        let (store, _dir) = setup();
        let pusher = Pusher::new(&store, "users", 3);
        let token = CancellationToken::new();
        pusher.push(&token, vec![create(1, 0, "u1")]).unwrap();

        token.cancel();
        let outcome = pusher
            .push(&token, vec![create(1, 0, "u1"), create(2, 1, "u2")])
            .unwrap();
        assert_eq!(outcome.already_applied, 1);
        assert_eq!(outcome.halt, Some(Halt::Cancelled));
        assert_eq!(outcome.pending.len(), 1);
        assert!(matches!(
            outcome.into_result(),
            Err(StrataError::SomeStatementsUnapplied { pending: 1 })
        ));
        assert_eq!(cursor(&store), 1);
    }

    #[test]
    fn test_statements_of_one_event_apply_together() {
        let (store, _dir) = setup();
        let pusher = Pusher::new(&store, "users", 3);
        let outcome = pusher
            .push(
                &CancellationToken::new(),
                vec![create(1, 0, "u1"), create(1, 0, "u2")],
            )
            .unwrap();
        assert_eq!(outcome.applied, 2);
        assert_eq!(names(&store).len(), 2);
    }

    #[test]
    fn test_mixed_instances_rejected() {
        let (store, _dir) = setup();
        let pusher = Pusher::new(&store, "users", 3);
        let other = Statement::from_parts("user", "other", 2, 0, Action::NoOp).unwrap();
        assert!(matches!(
            pusher.push(&CancellationToken::new(), vec![create(1, 0, "u1"), other]),
            Err(StrataError::InvalidState(_))
        ));
    }

    #[test]
    fn test_empty_batch() {
        let (store, _dir) = setup();
        let outcome = Pusher::new(&store, "users", 3)
            .push(&CancellationToken::new(), vec![])
            .unwrap();
        assert!(outcome.is_complete());
        assert!(outcome.cursors.is_empty());
    }
}

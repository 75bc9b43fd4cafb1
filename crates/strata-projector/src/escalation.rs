//! Failure escalation for statements the target store rejects
//!
//! Every failure is counted per `(projection, instance, sequence)` inside
//! the pusher's transaction. Below the skip threshold the batch halts so the
//! event is retried by a later tick; at the threshold the event is skipped
//! and the projection moves on.

use strata_core::{observe, ProjectionTxn, Result, Statement, StrataError};

/// What the pusher does after a failed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationAction {
    /// Stop the batch at the failed statement
    Halt,
    /// Advance the cursor past the failed statement and continue
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalated {
    pub failure_count: u32,
    pub action: EscalationAction,
}

pub struct Escalation<'a> {
    projection: &'a str,
    max_failure_count: u32,
}

impl<'a> Escalation<'a> {
    pub fn new(projection: &'a str, max_failure_count: u32) -> Self {
        Self {
            projection,
            max_failure_count,
        }
    }

    /// Record the failure of `statement` and decide how the batch goes on
    pub fn escalate<T: ProjectionTxn + ?Sized>(
        &self,
        txn: &mut T,
        statement: &Statement,
        error: &StrataError,
    ) -> Result<Escalated> {
        let failure_count = txn.record_failure(
            self.projection,
            &statement.instance_id,
            statement.sequence,
            &error.to_string(),
        )?;

        let action = if failure_count >= self.max_failure_count {
            tracing::warn!(
                projection = self.projection,
                instance = %statement.instance_id,
                sequence = statement.sequence,
                failure_count,
                error = %error,
                "statement failed too often, skipping event"
            );
            EscalationAction::Skip
        } else {
            tracing::info!(
                projection = self.projection,
                instance = %statement.instance_id,
                sequence = statement.sequence,
                failure_count,
                max_failure_count = self.max_failure_count,
                error = %error,
                "statement failed, retrying on next run"
            );
            EscalationAction::Halt
        };

        observe::record_statement_failure(self.projection, action == EscalationAction::Skip);

        Ok(Escalated {
            failure_count,
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ProjectionStore, StoreConfig};
    use strata_sqlite::SqliteStore;

    #[test]
    fn test_halts_until_threshold_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(StoreConfig::new(dir.path().join("strata.db"))).unwrap();
        let statement =
            Statement::from_parts("user", "inst", 4, 3, strata_core::Action::NoOp).unwrap();
        let escalation = Escalation::new("users", 3);

        let mut actions = Vec::new();
        for _ in 0..3 {
            let mut txn = Box::new(store.begin_txn().unwrap());
            let escalated = escalation
                .escalate(txn.as_mut(), &statement, &StrataError::NoTable)
                .unwrap();
            txn.commit().unwrap();
            actions.push((escalated.failure_count, escalated.action));
        }

        assert_eq!(
            actions,
            vec![
                (1, EscalationAction::Halt),
                (2, EscalationAction::Halt),
                (3, EscalationAction::Skip)
            ]
        );
        let failed = store.failed_events("users").unwrap();
        assert_eq!(failed[0].failure_count, 3);
        assert_eq!(failed[0].error, "statement has no table");
    }
}

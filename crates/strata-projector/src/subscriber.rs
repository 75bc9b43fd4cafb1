//! Live push path
//!
//! Receives events from the bus, folds already queued events into one
//! micro-batch per instance, reduces and pushes them. This path is a latency
//! optimisation only: anything it cannot apply (gaps, failures, reducer
//! errors) is handed to the scheduler as a catch-up request. Pushes run on
//! the blocking pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_bus::Subscription;
use strata_core::{Event, ProjectionStore, ReducerSet, Result, Statement};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::blocking;
use crate::pusher::Pusher;

pub struct Subscriber<S: ProjectionStore> {
    projection: String,
    reducers: Arc<ReducerSet>,
    store: Arc<S>,
    max_failure_count: u32,
    coalesce_max: usize,
    catch_up: mpsc::UnboundedSender<String>,
}

impl<S: ProjectionStore + 'static> Subscriber<S> {
    pub fn new(
        projection: impl Into<String>,
        reducers: ReducerSet,
        store: Arc<S>,
        max_failure_count: u32,
        coalesce_max: usize,
        catch_up: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            projection: projection.into(),
            reducers: Arc::new(reducers),
            store,
            max_failure_count,
            coalesce_max,
            catch_up,
        }
    }

    /// Consume `subscription` until `token` is cancelled or the bus closes
    pub async fn run(self, mut subscription: Subscription, token: CancellationToken) {
        tracing::debug!(projection = %self.projection, "subscriber started");
        loop {
            let first = tokio::select! {
                _ = token.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!(projection = %self.projection, "event bus closed");
                        break;
                    }
                },
            };

            let mut events = vec![first];
            events.extend(subscription.drain(self.coalesce_max));
            self.handle(&token, events).await;
        }
        tracing::debug!(projection = %self.projection, "subscriber stopped");
    }

    /// Reduce and push a micro-batch, returning the instances handed to
    /// catch-up
    pub async fn handle(&self, token: &CancellationToken, events: Vec<Event>) -> Vec<String> {
        let mut by_instance: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        for event in events {
            by_instance
                .entry(event.instance_id.clone())
                .or_default()
                .push(event);
        }

        let mut requested = Vec::new();
        for (instance_id, events) in by_instance {
            let caught_up = match self.apply(token, events).await {
                Ok(complete) => complete,
                Err(e) => {
                    tracing::warn!(
                        projection = %self.projection,
                        instance = %instance_id,
                        error = %e,
                        "live push failed"
                    );
                    false
                }
            };
            if !caught_up && !token.is_cancelled() {
                tracing::debug!(
                    projection = %self.projection,
                    instance = %instance_id,
                    "requesting catch-up"
                );
                let _ = self.catch_up.send(instance_id.clone());
                requested.push(instance_id);
            }
        }
        requested
    }

    async fn apply(&self, token: &CancellationToken, events: Vec<Event>) -> Result<bool> {
        let projection = self.projection.clone();
        let reducers = self.reducers.clone();
        let store = self.store.clone();
        let max_failure_count = self.max_failure_count;
        let token = token.clone();

        blocking::run(move || {
            let mut statements: Vec<Statement> = Vec::with_capacity(events.len());
            for event in &events {
                statements.extend(reducers.reduce(event)?);
            }
            let outcome = Pusher::new(store.as_ref(), &projection, max_failure_count)
                .push(&token, statements)?;
            Ok(outcome.is_complete())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strata_bus::EventBus;
    use strata_core::{
        AggregateType, Column, EventKind, Reduce, StoreConfig, TypedReducer,
    };
    use strata_sqlite::SqliteStore;
    use tempfile::TempDir;

    struct Added;

    impl EventKind for Added {
        fn aggregate_type() -> AggregateType {
            "user".into()
        }

        fn decode(event: &Event) -> Result<Option<Self>> {
            Ok((event.event_type.as_str() == "user.added").then_some(Added))
        }
    }

    struct Users;

    impl Reduce<Added> for Users {
        fn reduce(&self, event: &Event, _kind: Added) -> Result<Vec<Statement>> {
            Ok(vec![Statement::create(
                event,
                "users",
                vec![Column::new("id", event.aggregate_id.as_str())],
            )?])
        }
    }

    fn event(instance: &str, sequence: u64, previous: u64, id: &str) -> Event {
        Event {
            instance_id: instance.into(),
            aggregate_type: "user".into(),
            aggregate_id: id.into(),
            sequence,
            previous_aggregate_sequence: 0,
            previous_aggregate_type_sequence: previous,
            event_type: "user.added".into(),
            creator: String::new(),
            created_at: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    fn setup() -> (Subscriber<SqliteStore>, Arc<SqliteStore>, mpsc::UnboundedReceiver<String>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(StoreConfig::new(dir.path().join("strata.db"))).unwrap());
        let reducers = ReducerSet::new()
            .with(TypedReducer::new(Users))
            .with_table("CREATE TABLE IF NOT EXISTS users (id TEXT PRIMARY KEY)");
        store.execute_ddl(reducers.ddl()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber::new("users", reducers, store.clone(), 3, 10, tx);
        (subscriber, store, rx, dir)
    }

    #[tokio::test]
    async fn test_groups_by_instance() {
        let (subscriber, store, mut rx, _dir) = setup();
        let requested = subscriber
            .handle(
                &CancellationToken::new(),
                vec![event("i1", 1, 0, "a"), event("i2", 2, 0, "b"), event("i1", 3, 1, "c")],
            )
            .await;
        assert!(requested.is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(store.cursors("users", "i1").unwrap()[0].sequence, 3);
        assert_eq!(store.cursors("users", "i2").unwrap()[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_gap_requests_catch_up() {
        let (subscriber, store, mut rx, _dir) = setup();
        let requested = subscriber
            .handle(&CancellationToken::new(), vec![event("i1", 5, 4, "a")])
            .await;
        assert_eq!(requested, vec!["i1".to_string()]);
        assert_eq!(rx.try_recv().unwrap(), "i1");
        assert!(store.cursors("users", "i1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_until_bus_closes() {
        let (subscriber, store, _rx, _dir) = setup();
        let bus = EventBus::new();
        let subscription = bus.subscribe(&["user".into()]).unwrap();
        bus.publish(&event("i1", 1, 0, "a")).unwrap();
        bus.publish(&event("i1", 2, 1, "b")).unwrap();
        bus.close();

        subscriber.run(subscription, CancellationToken::new()).await;
        assert_eq!(store.cursors("users", "i1").unwrap()[0].sequence, 2);
    }
}

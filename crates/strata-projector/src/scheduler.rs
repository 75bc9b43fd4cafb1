//! Bulk catch-up
//!
//! Each tick discovers the instances with events for the projection, groups
//! them into lease chunks of `concurrent_instances` and drains every instance
//! of a chunk page by page while the chunk's lease is held:
//!
//! ```text
//! idle -> locking -> fetching -> reducing -> pushing -> idle
//!                       ^                       |
//!                       +-- page was full ------+
//! ```
//!
//! Lease loss or shutdown cancels the chunk's token. The pusher always
//! commits or rolls back its transaction before the cancellation is
//! observed. Store and log calls run on the blocking pool.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use strata_core::{
    observe, AggregateType, EventLog, EventQuery, InstanceQuery, LeaseStore, NewEvent,
    ProjectionConfig, ProjectionStore, ReducerSet, Result, Sequence, Statement, StrataError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::blocking;
use crate::lease::{cancel_on_err, Lease};
use crate::pusher::Pusher;

/// Aggregate type of the engine's own milestone events
pub const MILESTONE_AGGREGATE_TYPE: &str = "projection";
/// Event type pushed the first time an instance is projected
pub const MILESTONE_FIRST_RUN: &str = "projection.first_run";

type Cursors = HashMap<AggregateType, Sequence>;

/// Summary of one tick or trigger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Instances drained under a lease
    pub instances: usize,
    /// Events fetched and pushed
    pub events: usize,
    /// Chunks skipped because another worker holds their lease
    pub contended_chunks: usize,
}

/// One fetched, reduced and pushed page
struct Page {
    fetched: usize,
    complete: bool,
}

/// Owned inputs of one page, moved onto the blocking pool
struct PageJob<S, E> {
    projection: String,
    reducers: Arc<ReducerSet>,
    store: Arc<S>,
    log: Arc<E>,
    bulk_limit: usize,
    max_failure_count: u32,
    instance_id: String,
}

impl<S: ProjectionStore, E: EventLog> PageJob<S, E> {
    /// Fetch, reduce and push one page. Cursors are advanced by whatever was
    /// committed, also when the page ends in an error.
    fn run(&self, token: &CancellationToken, cursors: &mut Cursors) -> Result<Page> {
        let mut query = EventQuery::new()
            .instance(self.instance_id.as_str())
            .limit(self.bulk_limit);
        for aggregate_type in self.reducers.aggregate_types() {
            let after = cursors.get(&aggregate_type).copied().unwrap_or(0);
            query = query.aggregate(aggregate_type, after);
        }

        let events = self.log.filter(&query)?;
        if events.is_empty() {
            return Ok(Page {
                fetched: 0,
                complete: true,
            });
        }

        let mut statements: Vec<Statement> = Vec::with_capacity(events.len());
        for event in &events {
            statements.extend(self.reducers.reduce(event).map_err(|e| {
                tracing::error!(
                    projection = %self.projection,
                    instance = %self.instance_id,
                    sequence = event.sequence,
                    event_type = %event.event_type,
                    error = %e,
                    "reducer failed"
                );
                e
            })?);
        }

        let outcome = Pusher::new(self.store.as_ref(), &self.projection, self.max_failure_count)
            .push(token, statements)?;
        cursors.extend(outcome.cursors.iter().map(|(t, s)| (t.clone(), *s)));

        let outcome = outcome.into_result()?;
        Ok(Page {
            fetched: events.len(),
            complete: outcome.is_complete(),
        })
    }
}

pub struct Scheduler<S, L, E>
where
    S: ProjectionStore,
    L: LeaseStore,
    E: EventLog,
{
    projection: String,
    reducers: Arc<ReducerSet>,
    store: Arc<S>,
    lease: Lease<L>,
    log: Arc<E>,
    config: ProjectionConfig,
}

impl<S, L, E> Scheduler<S, L, E>
where
    S: ProjectionStore + 'static,
    L: LeaseStore + 'static,
    E: EventLog + 'static,
{
    pub fn new(
        projection: impl Into<String>,
        reducers: ReducerSet,
        store: Arc<S>,
        lease: Lease<L>,
        log: Arc<E>,
        config: ProjectionConfig,
    ) -> Self {
        Self {
            projection: projection.into(),
            reducers: Arc::new(reducers),
            store,
            lease,
            log,
            config,
        }
    }

    pub fn lease(&self) -> &Lease<L> {
        &self.lease
    }

    /// Run ticks every `requeue_every` (or `retry_failed_after` after a
    /// failed tick) and catch-up requests as they arrive, until `token` is
    /// cancelled
    pub async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        mut requests: mpsc::UnboundedReceiver<String>,
    ) {
        tracing::debug!(projection = %self.projection, "scheduler started");

        let timer = tokio::time::sleep(std::time::Duration::ZERO);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(instance_id) = requests.recv() => {
                    let mut instance_ids = BTreeSet::from([instance_id]);
                    while let Ok(more) = requests.try_recv() {
                        instance_ids.insert(more);
                    }
                    let instance_ids: Vec<String> = instance_ids.into_iter().collect();
                    match self.trigger(&token, &instance_ids).await {
                        Ok(report) => tracing::debug!(
                            projection = %self.projection,
                            events = report.events,
                            "catch-up request done"
                        ),
                        Err(e) => tracing::debug!(
                            projection = %self.projection,
                            instances = ?instance_ids,
                            error = %e,
                            "catch-up request not finished, left to the next tick"
                        ),
                    }
                }
                _ = &mut timer => {
                    let delay = match self.tick(&token).await {
                        Ok(_) => self.config.requeue_every(),
                        Err(e) => {
                            tracing::warn!(
                                projection = %self.projection,
                                error = %e,
                                "catch-up tick failed"
                            );
                            self.config.retry_failed_after()
                        }
                    };
                    timer.as_mut().reset(tokio::time::Instant::now() + delay);
                }
            }
        }

        tracing::debug!(projection = %self.projection, "scheduler stopped");
    }

    /// One catch-up pass over all active instances
    ///
    /// Chunks whose lease is held elsewhere are skipped. Errors of single
    /// instances do not stop the tick; the first one is returned at the end.
    pub async fn tick(&self, token: &CancellationToken) -> Result<TickReport> {
        let start = Instant::now();
        let mut exclude = Vec::new();
        if let Some(system) = &self.config.system_instance_id {
            exclude.push(system.clone());
        }
        let query = InstanceQuery {
            aggregate_types: self.reducers.aggregate_types(),
            exclude,
        };
        let log = self.log.clone();
        let instance_ids = blocking::run(move || log.instance_ids(&query)).await?;

        let mut report = TickReport::default();
        let mut first_err = None;
        for chunk in instance_ids.chunks(self.config.concurrent_instances.max(1)) {
            if token.is_cancelled() {
                break;
            }
            match self.run_chunk(token, chunk, false, &mut report).await {
                Ok(()) => {}
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        observe::record_tick(start.elapsed(), report.events as u64, first_err.is_none());
        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::debug!(
                    projection = %self.projection,
                    instances = report.instances,
                    events = report.events,
                    contended = report.contended_chunks,
                    "catch-up tick finished"
                );
                Ok(report)
            }
        }
    }

    /// Drain all pending events of `instance_ids` now
    ///
    /// Fails with [`StrataError::Lock`] when another worker holds the lease
    /// of one of the instances.
    pub async fn trigger(
        &self,
        token: &CancellationToken,
        instance_ids: &[String],
    ) -> Result<TickReport> {
        let mut report = TickReport::default();
        for chunk in instance_ids.chunks(self.config.concurrent_instances.max(1)) {
            self.run_chunk(token, chunk, true, &mut report).await?;
        }
        Ok(report)
    }

    async fn run_chunk(
        &self,
        token: &CancellationToken,
        chunk: &[String],
        fail_on_contention: bool,
        report: &mut TickReport,
    ) -> Result<()> {
        let chunk_token = token.child_token();
        let instance_ids = chunk.to_vec();

        let mut lease = self
            .lease
            .lock(&chunk_token, self.config.lease_duration(), instance_ids.clone())
            .await;
        match lease.recv().await {
            Some(Ok(())) => {}
            Some(Err(StrataError::Lock(msg))) if !fail_on_contention => {
                tracing::debug!(
                    projection = %self.projection,
                    instances = ?instance_ids,
                    reason = %msg,
                    "chunk leased by another worker, skipping"
                );
                report.contended_chunks += 1;
                return Ok(());
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(StrataError::Lock(
                    "lease channel closed before acquisition".into(),
                ))
            }
        }
        let watcher = cancel_on_err(lease, chunk_token.clone());

        let mut result = Ok(());
        for instance_id in &instance_ids {
            if chunk_token.is_cancelled() {
                result = Err(StrataError::Cancelled);
                break;
            }
            match self.catch_up(&chunk_token, instance_id).await {
                Ok(events) => {
                    report.instances += 1;
                    report.events += events;
                }
                Err(e) => {
                    tracing::warn!(
                        projection = %self.projection,
                        instance = %instance_id,
                        error = %e,
                        "catch-up failed"
                    );
                    if result.is_ok() {
                        result = Err(e);
                    }
                    if fail_on_contention {
                        break;
                    }
                }
            }
        }

        // lease loss surfaces as cancellation; report it as such
        let lease_lost = chunk_token.is_cancelled() && !token.is_cancelled();
        chunk_token.cancel();
        let _ = watcher.await;
        self.lease.unlock(&instance_ids).await;

        if lease_lost {
            if let Err(StrataError::Cancelled) = result {
                return Err(StrataError::Lock(format!(
                    "lease of projection '{}' lost during catch-up",
                    self.projection
                )));
            }
        }
        result
    }

    /// Drain one instance page by page, returning the number of events
    /// fetched
    async fn catch_up(&self, token: &CancellationToken, instance_id: &str) -> Result<usize> {
        let mut cursors = self.cursor_map(instance_id).await?;
        // checked after every committed page: a later page may fail
        let mut first_run = self.config.milestones && cursors.values().all(|s| *s == 0);
        let mut total = 0;

        loop {
            if token.is_cancelled() {
                return Err(StrataError::Cancelled);
            }
            let job = self.page_job(instance_id);
            let page_token = token.clone();
            let (page, advanced) = blocking::run(move || {
                let page = job.run(&page_token, &mut cursors);
                Ok((page, cursors))
            })
            .await?;
            cursors = advanced;

            if first_run && cursors.values().any(|s| *s > 0) {
                self.push_milestone(instance_id).await?;
                first_run = false;
            }

            let page = page?;
            total += page.fetched;
            if !page.complete || page.fetched < self.config.bulk_limit {
                break;
            }
            // let the lease renewal run between pages
            tokio::task::yield_now().await;
        }
        Ok(total)
    }

    fn page_job(&self, instance_id: &str) -> PageJob<S, E> {
        PageJob {
            projection: self.projection.clone(),
            reducers: self.reducers.clone(),
            store: self.store.clone(),
            log: self.log.clone(),
            bulk_limit: self.config.bulk_limit,
            max_failure_count: self.config.max_failure_count,
            instance_id: instance_id.to_string(),
        }
    }

    async fn cursor_map(&self, instance_id: &str) -> Result<Cursors> {
        let mut cursors: Cursors = self
            .reducers
            .aggregate_types()
            .into_iter()
            .map(|t| (t, 0))
            .collect();
        let store = self.store.clone();
        let projection = self.projection.clone();
        let instance_id = instance_id.to_string();
        let stored = blocking::run(move || store.cursors(&projection, &instance_id)).await?;
        for cursor in stored {
            cursors.insert(cursor.aggregate_type, cursor.sequence);
        }
        Ok(cursors)
    }

    async fn push_milestone(&self, instance_id: &str) -> Result<()> {
        let event = NewEvent::new(
            instance_id,
            MILESTONE_AGGREGATE_TYPE,
            self.projection.as_str(),
            MILESTONE_FIRST_RUN,
        )
        .with_payload(&serde_json::json!({ "projection": self.projection }))?;
        let log = self.log.clone();
        blocking::run(move || log.push(event)).await?;
        tracing::info!(
            projection = %self.projection,
            instance = %instance_id,
            "projection ran for the first time"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{
        Column, Event, EventKind, Reduce, StoreConfig, TypedReducer,
    };
    use strata_sqlite::{SqliteEventLog, SqliteStore};
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
                vec![
                    Column::new("id", event.aggregate_id.as_str()),
                    Column::new("instance_id", event.instance_id.as_str()),
                ],
            )?])
        }
    }

    struct Setup {
        scheduler: Scheduler<SqliteStore, SqliteStore, SqliteEventLog>,
        store: Arc<SqliteStore>,
        log: Arc<SqliteEventLog>,
        _dir: TempDir,
    }

    fn setup(config: ProjectionConfig) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::new(dir.path().join("strata.db"));
        let store = Arc::new(SqliteStore::open(cfg.clone()).unwrap());
        let log = Arc::new(SqliteEventLog::open(&cfg).unwrap());
        let reducers = ReducerSet::new().with(TypedReducer::new(Users)).with_table(
            "CREATE TABLE IF NOT EXISTS users (id TEXT, instance_id TEXT, PRIMARY KEY (instance_id, id))",
        );
        store.execute_ddl(reducers.ddl()).unwrap();
        let lease = Lease::from_config(store.clone(), "users", &config);
        Setup {
            scheduler: Scheduler::new("users", reducers, store.clone(), lease, log.clone(), config),
            store,
            log,
            _dir: dir,
        }
    }

    fn add(log: &SqliteEventLog, instance: &str, id: &str) {
        log.push(NewEvent::new(instance, "user", id, "user.added")).unwrap();
    }

    fn cursor(store: &SqliteStore, instance: &str) -> u64 {
        store
            .cursors("users", instance)
            .unwrap()
            .iter()
            .find(|c| c.aggregate_type.as_str() == "user")
            .map_or(0, |c| c.sequence)
    }

    #[tokio::test]
    async fn test_trigger_drains_in_pages() {
        let s = setup(ProjectionConfig::new().with_bulk_limit(2));
        for i in 0..5 {
            add(&s.log, "i1", &format!("u{}", i));
        }

        let report = s
            .scheduler
            .trigger(&CancellationToken::new(), &["i1".to_string()])
            .await
            .unwrap();
        assert_eq!(report.events, 5);
        assert_eq!(cursor(&s.store, "i1"), 5);
    }

    #[tokio::test]
    async fn test_tick_skips_system_instance() {
        let s = setup(ProjectionConfig::new().with_system_instance("system"));
        add(&s.log, "i1", "a");
        add(&s.log, "system", "b");
        add(&s.log, "i2", "c");

        let report = s.scheduler.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.instances, 2);
        assert_eq!(cursor(&s.store, "i1"), 1);
        assert_eq!(cursor(&s.store, "i2"), 3);
        assert_eq!(cursor(&s.store, "system"), 0);
    }

    #[tokio::test]
    async fn test_trigger_fails_when_leased_elsewhere() {
        let s = setup(ProjectionConfig::new());
        add(&s.log, "i1", "a");
        let now = chrono::Utc::now();
        s.store
            .try_lock(
                "users",
                "other-worker",
                &["i1".to_string()],
                now,
                now + chrono::Duration::seconds(30),
            )
            .unwrap();

        let err = s
            .scheduler
            .trigger(&CancellationToken::new(), &["i1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Lock(_)));

        let report = s.scheduler.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.contended_chunks, 1);
        assert_eq!(cursor(&s.store, "i1"), 0);
    }

    #[tokio::test]
    async fn test_milestone_on_first_run_only() {
        let s = setup(ProjectionConfig::new().with_milestones(true));
        add(&s.log, "i1", "a");
        let token = CancellationToken::new();
        let ids = ["i1".to_string()];

        s.scheduler.trigger(&token, &ids).await.unwrap();
        add(&s.log, "i1", "b");
        s.scheduler.trigger(&token, &ids).await.unwrap();

        let milestones = s
            .log
            .filter(&EventQuery::new().aggregate(MILESTONE_AGGREGATE_TYPE, 0))
            .unwrap();
        assert_eq!(milestones.len(), 1);
        assert_eq!(milestones[0].event_type.as_str(), MILESTONE_FIRST_RUN);
        assert_eq!(milestones[0].payload["projection"], "users");
    }

    #[tokio::test]
    async fn test_milestone_survives_failing_page() {
        let s = setup(
            ProjectionConfig::new()
                .with_bulk_limit(1)
                .with_milestones(true)
                .with_max_failure_count(2),
        );
        add(&s.log, "i1", "a");
        // same primary key, fails until skipped
        add(&s.log, "i1", "a");
        let token = CancellationToken::new();
        let ids = ["i1".to_string()];

        let err = s.scheduler.trigger(&token, &ids).await.unwrap_err();
        assert!(matches!(err, StrataError::StatementFailed { sequence: 2, .. }));
        assert_eq!(cursor(&s.store, "i1"), 1);
        s.scheduler.trigger(&token, &ids).await.unwrap();
        assert_eq!(cursor(&s.store, "i1"), 2);

        let milestones = s
            .log
            .filter(
                &EventQuery::new()
                    .aggregate(MILESTONE_AGGREGATE_TYPE, 0)
                    .instance("i1"),
            )
            .unwrap();
        assert_eq!(milestones.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_contended_store_does_not_starve_runtime() {
        let s = setup(ProjectionConfig::new());
        add(&s.log, "i1", "a");

        // hold the store's connection from another thread for a while
        let store = s.store.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _conn = store.conn().lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(300));
        });
        locked_rx.recv().unwrap();

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });

        s.scheduler
            .trigger(&CancellationToken::new(), &["i1".to_string()])
            .await
            .unwrap();
        ticker.abort();
        holder.join().unwrap();

        // the ticker kept running while the trigger waited on the store
        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) > 5);
        assert_eq!(cursor(&s.store, "i1"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_trigger() {
        let s = setup(ProjectionConfig::new());
        add(&s.log, "i1", "a");
        let token = CancellationToken::new();
        token.cancel();
        let err = s
            .scheduler
            .trigger(&token, &["i1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Cancelled));
        assert_eq!(cursor(&s.store, "i1"), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let s = setup(ProjectionConfig::new());
        add(&s.log, "i1", "a");
        let store = s.store.clone();
        let scheduler = Arc::new(s.scheduler);
        let token = CancellationToken::new();
        let (_tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(scheduler.run(token.clone(), rx));

        for _ in 0..50 {
            if cursor(&store, "i1") == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(cursor(&store, "i1"), 1);
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}

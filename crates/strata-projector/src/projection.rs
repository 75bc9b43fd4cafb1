use std::sync::Arc;

use strata_bus::EventBus;
use strata_core::{
    Cursor, EventLog, FailedEvent, LeaseStore, ProjectionConfig, ProjectionStore, ReducerSet,
    Result, StrataError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lease::Lease;
use crate::scheduler::{Scheduler, TickReport};
use crate::subscriber::Subscriber;

/// A named read model: one reducer set applied to its store by a live
/// subscriber and a catch-up scheduler
pub struct Projection<S, L, E>
where
    S: ProjectionStore,
    L: LeaseStore,
    E: EventLog,
{
    name: String,
    reducers: ReducerSet,
    store: Arc<S>,
    scheduler: Arc<Scheduler<S, L, E>>,
    config: ProjectionConfig,
    bus: Option<EventBus>,
}

impl<S, L, E> Projection<S, L, E>
where
    S: ProjectionStore + 'static,
    L: LeaseStore + 'static,
    E: EventLog + 'static,
{
    pub fn new(
        name: impl Into<String>,
        reducers: ReducerSet,
        store: Arc<S>,
        lease_store: Arc<L>,
        log: Arc<E>,
        config: ProjectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        if name.is_empty() {
            return Err(StrataError::Config("projection name must not be empty".into()));
        }
        if reducers.is_empty() {
            return Err(StrataError::Config(format!(
                "projection '{}' has no reducers",
                name
            )));
        }
        reducers.validate()?;

        let lease = Lease::from_config(lease_store, name.clone(), &config);
        let scheduler = Scheduler::new(
            name.clone(),
            reducers.clone(),
            store.clone(),
            lease,
            log,
            config.clone(),
        );

        Ok(Self {
            name,
            reducers,
            store,
            scheduler: Arc::new(scheduler),
            config,
            bus: None,
        })
    }

    /// Receive live events from `bus` once projecting
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Worker identity used for this projection's leases
    pub fn locker_id(&self) -> &str {
        self.scheduler.lease().locker_id()
    }

    /// Create the projection's tables
    pub fn init(&self) -> Result<()> {
        self.store.execute_ddl(self.reducers.ddl())?;
        tracing::info!(projection = %self.name, "projection initialized");
        Ok(())
    }

    /// Drain every pending event of `instance_ids` before returning
    ///
    /// Gaps, failed statements and reducer errors are returned as errors;
    /// the applied prefix stays committed. Fails with
    /// [`StrataError::Lock`] while another worker holds a lease.
    pub async fn trigger(
        &self,
        token: &CancellationToken,
        instance_ids: &[String],
    ) -> Result<TickReport> {
        self.scheduler.trigger(token, instance_ids).await
    }

    /// Run the background subscriber and scheduler until `token` is
    /// cancelled or [`ProjectionHandle::shutdown`] is called
    ///
    /// The handle only ever cancels its own tasks, so `token` can be shared
    /// by every projection of a process.
    pub fn project(&self, token: CancellationToken) -> Result<ProjectionHandle> {
        let token = token.child_token();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(2);

        if let Some(bus) = &self.bus {
            let subscription = bus.subscribe(&self.reducers.aggregate_types())?;
            let subscriber = Subscriber::new(
                self.name.clone(),
                self.reducers.clone(),
                self.store.clone(),
                self.config.max_failure_count,
                self.config.coalesce_max,
                requests_tx,
            );
            tasks.push(tokio::spawn(subscriber.run(subscription, token.clone())));
        } else {
            drop(requests_tx);
        }

        tasks.push(tokio::spawn(
            self.scheduler.clone().run(token.clone(), requests_rx),
        ));

        tracing::info!(projection = %self.name, live = self.bus.is_some(), "projecting");
        Ok(ProjectionHandle { token, tasks })
    }

    pub fn cursors(&self, instance_id: &str) -> Result<Vec<Cursor>> {
        self.store.cursors(&self.name, instance_id)
    }

    pub fn failed_events(&self) -> Result<Vec<FailedEvent>> {
        self.store.failed_events(&self.name)
    }
}

/// Owner of a projection's background tasks
///
/// Dropping the handle cancels the tasks without waiting for them. The
/// token passed to [`Projection::project`] is never cancelled by the handle.
pub struct ProjectionHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ProjectionHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }

    /// Cancel the background tasks and wait for them to stop. In-flight
    /// pushes commit before the tasks return.
    pub async fn shutdown(mut self) -> Result<()> {
        self.token.cancel();
        let mut result = Ok(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "projection task failed");
                result = Err(StrataError::InvalidState(format!(
                    "projection task failed: {}",
                    e
                )));
            }
        }
        result
    }
}

impl Drop for ProjectionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

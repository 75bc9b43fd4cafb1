//! Instance leases with background renewal
//!
//! A lease is a fencing token: whoever holds it may advance the projection
//! for its instances. Work done under a lease must run on a token that is
//! cancelled as soon as the lease is lost, see [`cancel_on_err`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use strata_core::{observe, LeaseStore, ProjectionConfig, Result, StrataError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::blocking;

/// Leases of one projection, held under one worker identity
pub struct Lease<L: LeaseStore> {
    store: Arc<L>,
    projection: String,
    locker_id: String,
    renew_every: Duration,
}

impl<L: LeaseStore + 'static> Lease<L> {
    pub fn new(
        store: Arc<L>,
        projection: impl Into<String>,
        locker_id: impl Into<String>,
        renew_every: Duration,
    ) -> Self {
        Self {
            store,
            projection: projection.into(),
            locker_id: locker_id.into(),
            renew_every,
        }
    }

    /// Lease for `projection` using the configured worker identity, or a
    /// random one
    pub fn from_config(store: Arc<L>, projection: impl Into<String>, cfg: &ProjectionConfig) -> Self {
        let locker_id = cfg
            .locker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self::new(store, projection, locker_id, cfg.lease_renew_interval())
    }

    pub fn locker_id(&self) -> &str {
        &self.locker_id
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// Acquire the leases of all `instance_ids` for `duration`
    ///
    /// The first message on the returned channel is the acquisition result.
    /// While acquired, the leases are renewed every renew interval until
    /// `token` is cancelled. A failed renewal sends an error and closes the
    /// channel; so does cancellation of `token`.
    pub async fn lock(
        &self,
        token: &CancellationToken,
        duration: Duration,
        instance_ids: Vec<String>,
    ) -> mpsc::Receiver<Result<()>> {
        let (tx, rx) = mpsc::channel(1);

        if self.renew_every.is_zero() || self.renew_every >= duration {
            let _ = tx.try_send(Err(StrataError::Config(format!(
                "lease renew interval {:?} must be shorter than the lease {:?}",
                self.renew_every, duration
            ))));
            return rx;
        }

        let acquired = blocking::run({
            let store = self.store.clone();
            let projection = self.projection.clone();
            let locker_id = self.locker_id.clone();
            let instance_ids = instance_ids.clone();
            move || try_lock(store.as_ref(), &projection, &locker_id, &instance_ids, duration)
        })
        .await;
        match acquired {
            Ok(true) => {
                tracing::debug!(
                    projection = %self.projection,
                    locker = %self.locker_id,
                    instances = ?instance_ids,
                    "lease acquired"
                );
                observe::record_lease(&self.projection, "acquired");
                let _ = tx.try_send(Ok(()));
            }
            Ok(false) => {
                observe::record_lease(&self.projection, "contended");
                let _ = tx.try_send(Err(StrataError::Lock(format!(
                    "projection '{}' is locked by another worker",
                    self.projection
                ))));
                return rx;
            }
            Err(e) => {
                let _ = tx.try_send(Err(e));
                return rx;
            }
        }

        let renewal = Renewal {
            store: self.store.clone(),
            projection: self.projection.clone(),
            locker_id: self.locker_id.clone(),
            renew_every: self.renew_every,
            duration,
            instance_ids,
        };
        tokio::spawn(renewal.run(token.clone(), tx));

        rx
    }

    /// Release the leases of `instance_ids` held by this worker
    ///
    /// Failures are logged only: the lease expires on its own.
    pub async fn unlock(&self, instance_ids: &[String]) {
        let released = blocking::run({
            let store = self.store.clone();
            let projection = self.projection.clone();
            let locker_id = self.locker_id.clone();
            let instance_ids = instance_ids.to_vec();
            move || store.unlock(&projection, &locker_id, &instance_ids, Utc::now())
        })
        .await;
        match released {
            Ok(()) => {
                tracing::debug!(
                    projection = %self.projection,
                    locker = %self.locker_id,
                    instances = ?instance_ids,
                    "lease released"
                );
            }
            Err(e) => {
                tracing::warn!(
                    projection = %self.projection,
                    locker = %self.locker_id,
                    error = %e,
                    "failed to release lease"
                );
            }
        }
    }
}

fn try_lock<L: LeaseStore + ?Sized>(
    store: &L,
    projection: &str,
    locker_id: &str,
    instance_ids: &[String],
    duration: Duration,
) -> Result<bool> {
    let now = Utc::now();
    let until = now
        + chrono::Duration::from_std(duration)
            .map_err(|e| StrataError::Config(format!("invalid lease duration: {}", e)))?;
    store.try_lock(projection, locker_id, instance_ids, now, until)
}

struct Renewal<L: LeaseStore> {
    store: Arc<L>,
    projection: String,
    locker_id: String,
    renew_every: Duration,
    duration: Duration,
    instance_ids: Vec<String>,
}

impl<L: LeaseStore + 'static> Renewal<L> {
    async fn run(self, token: CancellationToken, tx: mpsc::Sender<Result<()>>) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.renew_every) => {}
            }

            let renewed = blocking::run({
                let store = self.store.clone();
                let projection = self.projection.clone();
                let locker_id = self.locker_id.clone();
                let instance_ids = self.instance_ids.clone();
                let duration = self.duration;
                move || try_lock(store.as_ref(), &projection, &locker_id, &instance_ids, duration)
            })
            .await;
            let err = match renewed {
                Ok(true) => {
                    tracing::trace!(projection = %self.projection, "lease renewed");
                    continue;
                }
                Ok(false) => StrataError::Lock(format!(
                    "lease of projection '{}' was taken over",
                    self.projection
                )),
                Err(e) => e,
            };

            tracing::warn!(
                projection = %self.projection,
                locker = %self.locker_id,
                error = %err,
                "lease lost"
            );
            observe::record_lease(&self.projection, "lost");
            let _ = tx.send(Err(err)).await;
            return;
        }
    }
}

/// Cancel `token` when the lease channel reports an error or closes
///
/// The returned task ends when either happens or `token` is cancelled.
pub fn cancel_on_err(
    mut lease: mpsc::Receiver<Result<()>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                msg = lease.recv() => match msg {
                    Some(Ok(())) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "cancelling work after lease error");
                        token.cancel();
                        return;
                    }
                    None => {
                        token.cancel();
                        return;
                    }
                },
            }
        }
    })
}

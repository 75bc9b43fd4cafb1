use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, StrataError};

/// Configuration for one projection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Interval between two catch-up ticks of the scheduler
    /// Default: 60s
    #[serde(default = "default_requeue_every_ms")]
    pub requeue_every_ms: u64,

    /// Delay before the next tick after a tick that ended in an error
    /// Default: 1s
    #[serde(default = "default_retry_failed_after_ms")]
    pub retry_failed_after_ms: u64,

    /// Maximum number of events fetched per catch-up page
    /// Default: 200
    #[serde(default = "default_bulk_limit")]
    pub bulk_limit: usize,

    /// Number of instances locked and caught up together
    /// Default: 10
    #[serde(default = "default_concurrent_instances")]
    pub concurrent_instances: usize,

    /// Failures of one event after which it is skipped
    /// Default: 5
    #[serde(default = "default_max_failure_count")]
    pub max_failure_count: u32,

    /// How long an acquired lease is valid
    /// Default: 30s
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Lease renewal interval, must be shorter than the lease duration
    /// Default: 10s
    #[serde(default = "default_lease_renew_interval_ms")]
    pub lease_renew_interval_ms: u64,

    /// Maximum number of queued events the subscriber folds into one push
    /// Default: 100
    #[serde(default = "default_coalesce_max")]
    pub coalesce_max: usize,

    /// Instance excluded from catch-up (the system instance)
    #[serde(default)]
    pub system_instance_id: Option<String>,

    /// Push a milestone event the first time an instance is projected
    /// Default: false
    #[serde(default)]
    pub milestones: bool,

    /// Worker identity used for leases; a random id when unset
    #[serde(default)]
    pub locker_id: Option<String>,
}

fn default_requeue_every_ms() -> u64 {
    60_000
}

fn default_retry_failed_after_ms() -> u64 {
    1_000
}

fn default_bulk_limit() -> usize {
    200
}

fn default_concurrent_instances() -> usize {
    10
}

fn default_max_failure_count() -> u32 {
    5
}

fn default_lease_duration_ms() -> u64 {
    30_000
}

fn default_lease_renew_interval_ms() -> u64 {
    10_000
}

fn default_coalesce_max() -> usize {
    100
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            requeue_every_ms: default_requeue_every_ms(),
            retry_failed_after_ms: default_retry_failed_after_ms(),
            bulk_limit: default_bulk_limit(),
            concurrent_instances: default_concurrent_instances(),
            max_failure_count: default_max_failure_count(),
            lease_duration_ms: default_lease_duration_ms(),
            lease_renew_interval_ms: default_lease_renew_interval_ms(),
            coalesce_max: default_coalesce_max(),
            system_instance_id: None,
            milestones: false,
            locker_id: None,
        }
    }
}

impl ProjectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requeue_every(mut self, every: Duration) -> Self {
        self.requeue_every_ms = every.as_millis() as u64;
        self
    }

    pub fn with_retry_failed_after(mut self, after: Duration) -> Self {
        self.retry_failed_after_ms = after.as_millis() as u64;
        self
    }

    pub fn with_bulk_limit(mut self, limit: usize) -> Self {
        self.bulk_limit = limit;
        self
    }

    pub fn with_concurrent_instances(mut self, n: usize) -> Self {
        self.concurrent_instances = n;
        self
    }

    pub fn with_max_failure_count(mut self, count: u32) -> Self {
        self.max_failure_count = count;
        self
    }

    /// Set the lease duration and renewal interval
    pub fn with_lease(mut self, duration: Duration, renew_every: Duration) -> Self {
        self.lease_duration_ms = duration.as_millis() as u64;
        self.lease_renew_interval_ms = renew_every.as_millis() as u64;
        self
    }

    pub fn with_coalesce_max(mut self, max: usize) -> Self {
        self.coalesce_max = max;
        self
    }

    pub fn with_system_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.system_instance_id = Some(instance_id.into());
        self
    }

    pub fn with_milestones(mut self, enabled: bool) -> Self {
        self.milestones = enabled;
        self
    }

    pub fn with_locker_id(mut self, locker_id: impl Into<String>) -> Self {
        self.locker_id = Some(locker_id.into());
        self
    }

    pub fn requeue_every(&self) -> Duration {
        Duration::from_millis(self.requeue_every_ms)
    }

    pub fn retry_failed_after(&self) -> Duration {
        Duration::from_millis(self.retry_failed_after_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_renew_interval_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bulk_limit == 0 {
            return Err(StrataError::Config("bulk_limit must be positive".into()));
        }
        if self.concurrent_instances == 0 {
            return Err(StrataError::Config(
                "concurrent_instances must be positive".into(),
            ));
        }
        if self.max_failure_count == 0 {
            return Err(StrataError::Config(
                "max_failure_count must be positive".into(),
            ));
        }
        if self.lease_renew_interval_ms == 0
            || self.lease_renew_interval_ms >= self.lease_duration_ms
        {
            return Err(StrataError::Config(format!(
                "lease renew interval ({}ms) must be positive and shorter than the lease ({}ms)",
                self.lease_renew_interval_ms, self.lease_duration_ms
            )));
        }
        if self.coalesce_max == 0 {
            return Err(StrataError::Config("coalesce_max must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ProjectionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_renew_must_be_shorter_than_lease() {
        let cfg = ProjectionConfig::new()
            .with_lease(Duration::from_secs(10), Duration::from_secs(10));
        assert!(matches!(cfg.validate(), Err(StrataError::Config(_))));
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(ProjectionConfig::new().with_bulk_limit(0).validate().is_err());
        assert!(ProjectionConfig::new()
            .with_max_failure_count(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_serde_defaults() {
        let cfg: ProjectionConfig =
            serde_json::from_str(r#"{"bulk_limit": 5, "milestones": true}"#).unwrap();
        assert_eq!(cfg.bulk_limit, 5);
        assert!(cfg.milestones);
        assert_eq!(cfg.max_failure_count, 5);
        assert_eq!(cfg.requeue_every(), Duration::from_secs(60));
    }
}

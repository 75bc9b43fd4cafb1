use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::LeaseInfo;

/// Persisted lease table used for mutual exclusion across workers
pub trait LeaseStore: Send + Sync {
    /// Take or extend the leases of all `instance_ids` for `locker_id`.
    ///
    /// A row is taken only when it is absent, already owned by `locker_id`,
    /// or expired at `now`. Either every row is taken and `true` returned, or
    /// nothing changes and `false` is returned.
    fn try_lock(
        &self,
        projection: &str,
        locker_id: &str,
        instance_ids: &[String],
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Expire the leases owned by `locker_id`
    fn unlock(
        &self,
        projection: &str,
        locker_id: &str,
        instance_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()>;

    fn leases(&self, projection: &str) -> Result<Vec<LeaseInfo>>;
}

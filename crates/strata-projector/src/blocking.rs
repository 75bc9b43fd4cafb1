//! Store calls are synchronous and may wait on SQLite's busy timeout; they
//! run on tokio's blocking pool so lease renewal and fencing keep running.

use strata_core::{Result, StrataError};

pub(crate) async fn run<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StrataError::InvalidState(format!("blocking store task failed: {}", e)))?
}

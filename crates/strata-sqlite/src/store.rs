use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    config::SynchronousMode, Cursor, FailedEvent, LeaseInfo, LeaseStore, ProjectionStore,
    Result, StoreConfig, StrataError,
};

use crate::codec::db_err;
use crate::txn::SqliteProjectionTxn;
use crate::{cursor, failed, lease, schema};

/// SQLite store for projection tables, cursors, leases and failed events
///
/// Every handle owns one connection. Workers sharing a database file open
/// their own handle; `BEGIN IMMEDIATE` and the busy timeout serialize their
/// writes.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
}

impl SqliteStore {
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        let conn = open_connection(&cfg)?;
        schema::init_schema(&conn)?;

        tracing::debug!(path = %cfg.path.display(), "opened strata store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: cfg,
        })
    }

    /// Get the underlying connection (for custom queries on projection
    /// tables)
    pub fn conn(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema_version(&self) -> Result<u32> {
        schema::schema_version(&self.conn.lock())
    }
}

/// Open and configure a connection on the configured database file
pub(crate) fn open_connection(cfg: &StoreConfig) -> Result<Connection> {
    if let Some(parent) = cfg.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open_with_flags(
        &cfg.path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )
    .map_err(db_err)?;

    configure_connection(&conn, cfg)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection, cfg: &StoreConfig) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
        .map_err(|e| StrataError::Config(e.to_string()))?;

    if cfg.wal_mode {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StrataError::Config(e.to_string()))?;
    }

    let sync_mode = match cfg.synchronous {
        SynchronousMode::Full => "FULL",
        SynchronousMode::Normal => "NORMAL",
        SynchronousMode::Off => "OFF",
    };
    conn.pragma_update(None, "synchronous", sync_mode)
        .map_err(|e| StrataError::Config(e.to_string()))?;

    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| StrataError::Config(e.to_string()))?;

    conn.pragma_update(None, "cache_size", cfg.cache_size)
        .map_err(|e| StrataError::Config(e.to_string()))?;

    Ok(())
}

impl ProjectionStore for SqliteStore {
    type Txn<'a> = SqliteProjectionTxn<'a>;

    fn begin_txn(&self) -> Result<Self::Txn<'_>> {
        SqliteProjectionTxn::new(self.conn.lock())
    }

    fn cursors(&self, projection: &str, instance_id: &str) -> Result<Vec<Cursor>> {
        cursor::list(&self.conn.lock(), projection, instance_id)
    }

    fn failed_events(&self, projection: &str) -> Result<Vec<FailedEvent>> {
        failed::list(&self.conn.lock(), projection)
    }

    fn execute_ddl(&self, ddl: &[String]) -> Result<()> {
        let conn = self.conn.lock();
        for statement in ddl {
            conn.execute_batch(statement).map_err(db_err)?;
        }
        Ok(())
    }
}

impl LeaseStore for SqliteStore {
    fn try_lock(
        &self,
        projection: &str,
        locker_id: &str,
        instance_ids: &[String],
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        lease::try_lock(&mut conn, projection, locker_id, instance_ids, now, locked_until)
    }

    fn unlock(
        &self,
        projection: &str,
        locker_id: &str,
        instance_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        lease::unlock(&self.conn.lock(), projection, locker_id, instance_ids, now)
    }

    fn leases(&self, projection: &str) -> Result<Vec<LeaseInfo>> {
        lease::list(&self.conn.lock(), projection)
    }
}

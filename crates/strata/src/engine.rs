//! Unified strata engine
//!
//! Bundles the SQLite store, the reference event log and the event bus of
//! one worker, and builds projections wired to them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_bus::EventBus;
use strata_core::{
    Event, EventLog, NewEvent, ProjectionConfig, ProjectionStore, ReducerSet, Result, StoreConfig,
};
use strata_projector::Projection;
use strata_sqlite::{SqliteEventLog, SqliteStore};

/// A projection running on the SQLite backend
pub type SqliteProjection = Projection<SqliteStore, SqliteStore, SqliteEventLog>;

/// One worker's view of a strata database
///
/// Several engines may open the same database file, each standing in for a
/// separate worker. Engines never share a bus: events appended through one
/// engine reach the others through catch-up.
pub struct Engine {
    store: Arc<SqliteStore>,
    log: Arc<SqliteEventLog>,
    bus: EventBus,
    config: StoreConfig,
}

impl Engine {
    /// Open a strata engine in the given directory
    ///
    /// Stores everything in `{path}/strata.db`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db_path: PathBuf = path.as_ref().join("strata.db");
        Self::open_with_config(StoreConfig::new(db_path))
    }

    /// Open with a custom store configuration
    pub fn open_with_config(config: StoreConfig) -> Result<Self> {
        Self::open_with_bus(config, EventBus::new())
    }

    /// Open with a custom store configuration, publishing on `bus`
    pub fn open_with_bus(config: StoreConfig, bus: EventBus) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(config.clone())?);
        let log = Arc::new(SqliteEventLog::open(&config)?.with_bus(bus.clone()));

        tracing::info!(path = %config.path.display(), "strata engine opened");

        Ok(Self {
            store,
            log,
            bus,
            config,
        })
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<SqliteEventLog> {
        &self.log
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Build a projection on this engine's store, log and bus and create its
    /// tables
    pub fn projection(
        &self,
        name: impl Into<String>,
        reducers: ReducerSet,
        config: ProjectionConfig,
    ) -> Result<SqliteProjection> {
        let projection = Projection::new(
            name,
            reducers,
            self.store.clone(),
            self.store.clone(),
            self.log.clone(),
            config,
        )?
        .with_bus(self.bus.clone());
        projection.init()?;
        Ok(projection)
    }

    /// Append an event to the log
    pub fn push(&self, event: NewEvent) -> Result<Event> {
        self.log.push(event)
    }

    /// Create tables outside of any projection
    pub fn execute_ddl(&self, ddl: &[String]) -> Result<()> {
        self.store.execute_ddl(ddl)
    }

    /// Close the event bus. Running subscribers drain and stop; catch-up keeps
    /// working.
    pub fn close(&self) {
        self.bus.close();
        tracing::info!(path = %self.config.path.display(), "strata engine closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{AggregateType, Column, Reducer, Statement};

    struct Users;

    impl Reducer for Users {
        fn aggregate_type(&self) -> AggregateType {
            "user".into()
        }

        fn reduce(&self, event: &Event) -> Result<Vec<Statement>> {
            Ok(vec![Statement::create(
                event,
                "users",
                vec![Column::new("id", event.aggregate_id.as_str())],
            )?])
        }
    }

    #[test]
    fn test_open_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        assert!(dir.path().join("strata.db").exists());
        assert_eq!(engine.store().schema_version().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_projection_is_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path()).unwrap();
        let projection = engine
            .projection(
                "users",
                ReducerSet::new()
                    .with(Users)
                    .with_table("CREATE TABLE IF NOT EXISTS users (id TEXT PRIMARY KEY)"),
                ProjectionConfig::default(),
            )
            .unwrap();

        engine
            .push(NewEvent::new("i1", "user", "u1", "user.added"))
            .unwrap();
        projection
            .trigger(&tokio_util::sync::CancellationToken::new(), &["i1".into()])
            .await
            .unwrap();

        let count: i64 = engine
            .store()
            .conn()
            .lock()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        engine.close();
        assert!(engine.bus().is_closed());
    }
}

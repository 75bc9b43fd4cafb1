//! Shared fixtures for the integration tests

#![allow(dead_code)]

use strata::prelude::*;
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub const USERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS users (
    instance_id TEXT NOT NULL,
    id TEXT NOT NULL,
    username TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    PRIMARY KEY (instance_id, id)
)";

#[derive(Debug, Serialize, Deserialize)]
pub struct UsernamePayload {
    pub username: String,
}

/// Events of the `user` aggregate this projection cares about
pub enum UserEvent {
    Added(UsernamePayload),
    Renamed(UsernamePayload),
    Removed,
    /// Always fails to apply
    Poisoned,
}

impl EventKind for UserEvent {
    fn aggregate_type() -> AggregateType {
        "user".into()
    }

    fn decode(event: &Event) -> Result<Option<Self>> {
        Ok(match event.event_type.as_str() {
            "user.added" => Some(UserEvent::Added(event.payload_as()?)),
            "user.renamed" => Some(UserEvent::Renamed(event.payload_as()?)),
            "user.removed" => Some(UserEvent::Removed),
            "user.poisoned" => Some(UserEvent::Poisoned),
            _ => None,
        })
    }
}

pub struct UserProjection;

impl Reduce<UserEvent> for UserProjection {
    fn reduce(&self, event: &Event, kind: UserEvent) -> Result<Vec<Statement>> {
        let statement = match kind {
            UserEvent::Added(added) => Statement::create(
                event,
                "users",
                vec![
                    Column::new("instance_id", event.instance_id.as_str()),
                    Column::new("id", event.aggregate_id.as_str()),
                    Column::new("username", added.username),
                    Column::new("sequence", event.sequence),
                ],
            )?,
            UserEvent::Renamed(renamed) => Statement::update(
                event,
                "users",
                vec![
                    Column::new("username", renamed.username),
                    Column::new("sequence", event.sequence),
                ],
                vec![
                    Condition::eq("instance_id", event.instance_id.as_str()),
                    Condition::eq("id", event.aggregate_id.as_str()),
                ],
            )?,
            UserEvent::Removed => Statement::delete(
                event,
                "users",
                vec![
                    Condition::eq("instance_id", event.instance_id.as_str()),
                    Condition::eq("id", event.aggregate_id.as_str()),
                ],
            )?,
            // an update without conditions is rejected at execution
            UserEvent::Poisoned => Statement::update(
                event,
                "users",
                vec![Column::new("username", "poisoned")],
                vec![],
            )?,
        };
        Ok(vec![statement])
    }
}

pub fn user_reducers() -> ReducerSet {
    ReducerSet::new()
        .with(TypedReducer::new(UserProjection))
        .with_table(USERS_TABLE)
}

pub fn open_engine() -> (Engine, TempDir) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path()).unwrap();
    (engine, dir)
}

/// Another worker on the same database file
pub fn open_worker(dir: &TempDir) -> Engine {
    Engine::open(dir.path()).unwrap()
}

pub fn user_added(instance: &str, id: &str, username: &str) -> NewEvent {
    NewEvent::new(instance, "user", id, "user.added")
        .with_payload(&UsernamePayload {
            username: username.to_string(),
        })
        .unwrap()
}

pub fn user_renamed(instance: &str, id: &str, username: &str) -> NewEvent {
    NewEvent::new(instance, "user", id, "user.renamed")
        .with_payload(&UsernamePayload {
            username: username.to_string(),
        })
        .unwrap()
}

pub fn user_poisoned(instance: &str, id: &str) -> NewEvent {
    NewEvent::new(instance, "user", id, "user.poisoned")
}

pub fn usernames(engine: &Engine, instance: &str) -> Vec<String> {
    let conn = engine.store().conn().lock();
    let mut stmt = conn
        .prepare("SELECT username FROM users WHERE instance_id = ?1 ORDER BY id")
        .unwrap();
    let rows = stmt.query_map([instance], |row| row.get(0)).unwrap();
    rows.map(|r| r.unwrap()).collect()
}

pub fn user_cursor(projection: &SqliteProjection, instance: &str) -> u64 {
    projection
        .cursors(instance)
        .unwrap()
        .iter()
        .find(|c| c.aggregate_type.as_str() == "user")
        .map_or(0, |c| c.sequence)
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

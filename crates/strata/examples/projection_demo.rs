//! Projection Example
//!
//! Demonstrates:
//! - Typed reducers turning events into statements
//! - Live projection through the event bus
//! - Catch-up of a second worker on the same database
//! - Failure escalation of a poisoned event
//!
//! Run with: cargo run --example projection_demo

use std::time::Duration;

use strata::prelude::*;
use strata::Executor;

#[derive(Debug, Serialize, Deserialize)]
struct Deposit {
    amount: i64,
}

enum AccountEvent {
    Opened,
    Deposited(Deposit),
    Closed,
}

impl EventKind for AccountEvent {
    fn aggregate_type() -> AggregateType {
        "account".into()
    }

    fn decode(event: &Event) -> Result<Option<Self>> {
        Ok(match event.event_type.as_str() {
            "account.opened" => Some(AccountEvent::Opened),
            "account.deposited" => Some(AccountEvent::Deposited(event.payload_as()?)),
            "account.closed" => Some(AccountEvent::Closed),
            _ => None,
        })
    }
}

struct Balances;

impl Reduce<AccountEvent> for Balances {
    fn reduce(&self, event: &Event, kind: AccountEvent) -> Result<Vec<Statement>> {
        let key = vec![
            Condition::eq("instance_id", event.instance_id.as_str()),
            Condition::eq("id", event.aggregate_id.as_str()),
        ];
        let statement = match kind {
            AccountEvent::Opened => Statement::create(
                event,
                "balances",
                vec![
                    Column::new("instance_id", event.instance_id.as_str()),
                    Column::new("id", event.aggregate_id.as_str()),
                    Column::new("balance", 0i64),
                ],
            )?,
            // the reducer only sees one event; the running total lives in SQL
            AccountEvent::Deposited(deposit) => {
                let params = vec![
                    Value::from(deposit.amount),
                    Value::from(event.instance_id.as_str()),
                    Value::from(event.aggregate_id.as_str()),
                ];
                Statement::exec(event, move |executor: &mut dyn Executor| {
                    executor.execute(
                        "UPDATE balances SET balance = balance + ?1 WHERE instance_id = ?2 AND id = ?3",
                        &params,
                    )?;
                    Ok(())
                })?
            }
            AccountEvent::Closed => Statement::delete(event, "balances", key)?,
        };
        Ok(vec![statement])
    }
}

const BALANCES: &str = "CREATE TABLE IF NOT EXISTS balances (
    instance_id TEXT NOT NULL,
    id TEXT NOT NULL,
    balance INTEGER NOT NULL,
    PRIMARY KEY (instance_id, id)
)";

fn reducers() -> ReducerSet {
    ReducerSet::new()
        .with(TypedReducer::new(Balances))
        .with_table(BALANCES)
}

fn deposit(instance: &str, account: &str, amount: i64) -> Result<NewEvent> {
    NewEvent::new(instance, "account", account, "account.deposited").with_payload(&Deposit { amount })
}

fn balances(engine: &Engine, instance: &str) -> Result<Vec<(String, i64)>> {
    let conn = engine.store().conn().lock();
    let mut stmt = conn
        .prepare("SELECT id, balance FROM balances WHERE instance_id = ?1 ORDER BY id")
        .map_err(|e| StrataError::Database(e.to_string()))?;
    let rows = stmt
        .query_map([instance], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| StrataError::Database(e.to_string()))?;
    rows.collect::<std::result::Result<_, _>>()
        .map_err(|e| StrataError::Database(e.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("strata=info")
        .init();

    println!("=== Projection Example ===\n");

    let temp_dir = tempfile::tempdir()?;

    // ========================================
    // 1. Live projection
    // ========================================
    println!("1. Projecting live events...");

    let engine = Engine::open(temp_dir.path())?;
    let config = ProjectionConfig::new()
        .with_requeue_every(Duration::from_millis(200))
        .with_milestones(true);
    let projection = engine.projection("balances", reducers(), config.clone())?;
    let handle = projection.project(CancellationToken::new())?;

    engine.push(NewEvent::new("bank-1", "account", "alice", "account.opened"))?;
    engine.push(deposit("bank-1", "alice", 100)?)?;
    engine.push(deposit("bank-1", "alice", 50)?)?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("✓ bank-1 balances: {:?}\n", balances(&engine, "bank-1")?);

    // ========================================
    // 2. Second worker catches up
    // ========================================
    println!("2. Second worker on the same database...");

    let worker = Engine::open(temp_dir.path())?;
    let second = worker.projection("balances", reducers(), config)?;
    let second_handle = second.project(CancellationToken::new())?;

    // appended through the first engine, never published to the worker's bus
    engine.push(NewEvent::new("bank-2", "account", "bob", "account.opened"))?;
    engine.push(deposit("bank-2", "bob", 7)?)?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("✓ bank-2 balances: {:?}", balances(&worker, "bank-2")?);
    for cursor in second.cursors("bank-2")? {
        println!("  cursor {} -> {}", cursor.aggregate_type, cursor.sequence);
    }
    println!();

    second_handle.shutdown().await?;
    handle.shutdown().await?;

    // ========================================
    // 3. Failure escalation
    // ========================================
    println!("3. Escalating a failing event...");

    // opening an existing account violates the primary key
    let strict = engine.projection(
        "balances",
        reducers(),
        ProjectionConfig::new().with_max_failure_count(2),
    )?;
    engine.push(NewEvent::new("bank-1", "account", "alice", "account.opened"))?;
    engine.push(deposit("bank-1", "alice", 1)?)?;

    let token = CancellationToken::new();
    let instances = vec!["bank-1".to_string()];
    match strict.trigger(&token, &instances).await {
        Ok(_) => println!("unexpected success"),
        Err(e) => println!("  first attempt: {}", e),
    }
    let report = strict.trigger(&token, &instances).await?;
    println!("✓ skipped after retries, {} events applied", report.events);
    for failed in strict.failed_events()? {
        println!(
            "  failed event {} of {} ({} attempts): {}",
            failed.failed_sequence, failed.instance_id, failed.failure_count, failed.error
        );
    }
    println!("✓ bank-1 balances: {:?}", balances(&engine, "bank-1")?);

    engine.close();
    println!("\n=== Example Complete ===");
    Ok(())
}

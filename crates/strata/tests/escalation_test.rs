//! Failure escalation: poisoned events are retried up to the skip threshold

mod common;

use common::*;
use strata::prelude::*;
use strata::{Halt, Pusher};

#[tokio::test]
async fn test_skip_after_threshold() {
    let (engine, _dir) = open_engine();
    let projection = engine
        .projection(
            "users",
            user_reducers(),
            ProjectionConfig::new().with_max_failure_count(3),
        )
        .unwrap();
    let token = CancellationToken::new();
    let tenant = ids(&["tenantA"]);

    engine.push(user_added("tenantA", "u1", "gigi")).unwrap();
    engine.push(user_poisoned("tenantA", "u1")).unwrap();
    engine.push(user_added("tenantA", "u2", "bibi")).unwrap();

    for attempt in 1..=2 {
        let err = projection.trigger(&token, &tenant).await.unwrap_err();
        assert!(
            matches!(err, StrataError::StatementFailed { sequence: 2, failure_count, .. } if failure_count == attempt),
            "attempt {} gave {:?}",
            attempt,
            err
        );
        assert_eq!(user_cursor(&projection, "tenantA"), 1);
    }

    projection.trigger(&token, &tenant).await.unwrap();
    assert_eq!(user_cursor(&projection, "tenantA"), 3);
    assert_eq!(usernames(&engine, "tenantA"), vec!["gigi", "bibi"]);

    let failed = projection.failed_events().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failed_sequence, 2);
    assert_eq!(failed[0].instance_id, "tenantA");
    assert_eq!(failed[0].failure_count, 3);
    assert!(failed[0].error.contains("no conditions"));
}

#[tokio::test]
async fn test_no_retries_after_skip() {
    let (engine, _dir) = open_engine();
    let projection = engine
        .projection(
            "users",
            user_reducers(),
            ProjectionConfig::new().with_max_failure_count(2),
        )
        .unwrap();
    let token = CancellationToken::new();
    let tenant = ids(&["tenantA"]);

    engine.push(user_poisoned("tenantA", "u1")).unwrap();
    let mut attempts = 0;
    while projection.trigger(&token, &tenant).await.is_err() {
        attempts += 1;
        assert!(attempts < 10, "event was never skipped");
    }
    assert_eq!(attempts, 1);

    engine.push(user_added("tenantA", "u2", "bibi")).unwrap();
    for _ in 0..3 {
        projection.trigger(&token, &tenant).await.unwrap();
    }
    assert_eq!(projection.failed_events().unwrap()[0].failure_count, 2);
    assert_eq!(user_cursor(&projection, "tenantA"), 2);
}

#[test]
fn test_failure_count_commits_with_prefix() {
    let (engine, _dir) = open_engine();
    engine.execute_ddl(&[USERS_TABLE.to_string()]).unwrap();
    let pusher = Pusher::new(engine.store().as_ref(), "users", 5);

    let ok = Statement::from_parts(
        "user",
        "tenantA",
        1,
        0,
        Action::create(
            "users",
            vec![
                Column::new("instance_id", "tenantA"),
                Column::new("id", "u1"),
                Column::new("username", "gigi"),
                Column::new("sequence", 1u64),
            ],
        ),
    )
    .unwrap();
    // NOT NULL violation
    let broken = Statement::from_parts(
        "user",
        "tenantA",
        2,
        1,
        Action::create("users", vec![Column::new("id", "u2")]),
    )
    .unwrap();

    let outcome = pusher
        .push(&CancellationToken::new(), vec![ok, broken])
        .unwrap();
    assert!(matches!(
        outcome.halt,
        Some(Halt::Failed {
            sequence: 2,
            failure_count: 1,
            ..
        })
    ));
    assert_eq!(usernames(&engine, "tenantA"), vec!["gigi"]);
    assert_eq!(engine.store().failed_events("users").unwrap().len(), 1);
}

//! Integration tests for the State Store's tiered get/put path and its
//! typed durable records (executions, continuous state).
//!
//! Each test creates a unique temporary database, runs migrations, and drops
//! it on completion so tests are fully isolated and idempotent.

use std::sync::Arc;

use conduit_db::pool;
use conduit_test_utils::{create_test_db, drop_test_db};
use uuid::Uuid;

use conduit_core::state_store::StateStore;

async fn new_store() -> (StateStore, String) {
    let (temp_pool, db_name) = create_test_db().await;
    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");
    (StateStore::new(Arc::new(temp_pool)), db_name)
}

#[tokio::test]
async fn put_then_get_returns_value_from_tier_a() {
    let (store, db_name) = new_store().await;

    store
        .put_state("routing.autonomous.reviewer", &serde_json::json!({"queue": "autonomous-pool"}), None)
        .await
        .expect("put should succeed");

    let value = store
        .get_state("routing.autonomous.reviewer")
        .await
        .expect("get should succeed");

    assert_eq!(value, Some(serde_json::json!({"queue": "autonomous-pool"})));
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_falls_through_to_tier_b_on_tier_a_miss() {
    let (store, db_name) = new_store().await;

    // A zero TTL expires the Tier A entry immediately, so the subsequent
    // get_state can only be served by a Tier B read.
    store
        .put_state(
            "routing.scheduled.digest",
            &serde_json::json!({"queue": "scheduler"}),
            Some(std::time::Duration::from_secs(0)),
        )
        .await
        .expect("put should succeed");

    let value = store
        .get_state("routing.scheduled.digest")
        .await
        .expect("get should succeed");
    assert_eq!(value, Some(serde_json::json!({"queue": "scheduler"})));

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_returns_none_for_missing_key() {
    let (store, db_name) = new_store().await;

    let value = store.get_state("nonexistent.key").await.expect("get should succeed");
    assert_eq!(value, None);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn append_then_get_execution_roundtrips() {
    let (store, db_name) = new_store().await;

    let execution_id = Uuid::new_v4();
    let trace_id = Uuid::new_v4();
    store
        .append_execution(execution_id, "reviewer", trace_id)
        .await
        .expect("append should succeed");

    let record = store.get_execution(execution_id).await.expect("get should succeed");
    assert_eq!(record.agent_name, "reviewer");
    assert_eq!(record.trace_id, trace_id);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn save_continuous_rejects_stale_version() {
    let (store, db_name) = new_store().await;

    store
        .save_continuous("standup-bot", &serde_json::json!({"turn": 1}), 0)
        .await
        .expect("first save should succeed at version 0");

    let err = store
        .save_continuous("standup-bot", &serde_json::json!({"turn": 2}), 0)
        .await
        .expect_err("stale expected_version should fail");

    assert!(matches!(
        err,
        conduit_core::state_store::StateStoreError::StaleVersion { .. }
    ));

    drop_test_db(&db_name).await;
}

//! Integration tests for the Concurrency Gate (spec.md §4.7).

use chrono::Utc;
use scheduler_core::execution;
use scheduler_core::gate::{self, GateDecision};
use scheduler_db::models::{ExecutionMode, LoadBalanceStrategy};
use scheduler_db::queries::tasks;
use scheduler_test_utils::{create_test_db, drop_test_db};
use serde_json::json;

async fn seed_task(pool: &sqlx::PgPool, mode: ExecutionMode) -> uuid::Uuid {
    tasks::insert_task(pool, "job", "* * * * *", &json!({}), mode, LoadBalanceStrategy::RoundRobin, 0, 30)
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn parallel_mode_always_proceeds() {
    let (pool, db_name) = create_test_db().await;
    let task_id = seed_task(&pool, ExecutionMode::Parallel).await;

    execution::create(&pool, task_id, Utc::now(), 0).await.unwrap();
    let decision = gate::evaluate(&pool, task_id, ExecutionMode::Parallel, Utc::now()).await.unwrap();
    assert_eq!(decision, GateDecision::Proceed, "parallel mode never looks at other non-terminal executions");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn skip_mode_skips_while_a_prior_run_is_still_non_terminal() {
    let (pool, db_name) = create_test_db().await;
    let task_id = seed_task(&pool, ExecutionMode::Skip).await;

    let first_firing = Utc::now();
    execution::create(&pool, task_id, first_firing, 0).await.unwrap();

    let second_firing = first_firing + chrono::Duration::seconds(60);
    let decision = gate::evaluate(&pool, task_id, ExecutionMode::Skip, second_firing).await.unwrap();
    assert!(matches!(decision, GateDecision::Skip { .. }));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn sequential_mode_drops_the_tick_while_a_prior_run_is_still_non_terminal() {
    let (pool, db_name) = create_test_db().await;
    let task_id = seed_task(&pool, ExecutionMode::Sequential).await;

    let first_firing = Utc::now();
    execution::create(&pool, task_id, first_firing, 0).await.unwrap();

    let second_firing = first_firing + chrono::Duration::seconds(60);
    let decision = gate::evaluate(&pool, task_id, ExecutionMode::Sequential, second_firing).await.unwrap();
    assert_eq!(decision, GateDecision::DropTick);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn sequential_mode_proceeds_once_the_prior_run_is_terminal() {
    let (pool, db_name) = create_test_db().await;
    let task_id = seed_task(&pool, ExecutionMode::Sequential).await;

    let first_firing = Utc::now();
    execution::create_skipped(&pool, task_id, first_firing, 0, "replaced").await.unwrap();

    let second_firing = first_firing + chrono::Duration::seconds(60);
    let decision = gate::evaluate(&pool, task_id, ExecutionMode::Sequential, second_firing).await.unwrap();
    assert_eq!(decision, GateDecision::Proceed, "a skipped (terminal) prior run must not block the gate");

    pool.close().await;
    drop_test_db(&db_name).await;
}

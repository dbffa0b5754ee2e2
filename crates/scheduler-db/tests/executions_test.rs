//! Integration tests for the execution state machine (spec.md §4.5).

use chrono::Utc;
use scheduler_db::models::{ExecutionMode, ExecutionStatus, LoadBalanceStrategy};
use scheduler_db::queries::{executions, executors, tasks};
use scheduler_test_utils::{create_test_db, drop_test_db};
use serde_json::json;

async fn seed_task_and_executor(pool: &sqlx::PgPool) -> (uuid::Uuid, uuid::Uuid) {
    let task = tasks::insert_task(
        pool, "job", "* * * * *", &json!({}),
        ExecutionMode::Parallel, LoadBalanceStrategy::RoundRobin, 2, 30,
    ).await.unwrap();
    let executor = executors::insert_executor(
        pool, "exec-1", "worker", "http://worker:9000", "http://worker:9000/health", &json!({}),
    ).await.unwrap();
    (task.id, executor.id)
}

#[tokio::test]
async fn lifecycle_pending_to_success() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, executor_id) = seed_task_and_executor(&pool).await;

    let exec = executions::insert_pending(&pool, task_id, Utc::now(), 2).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Pending);

    let started = executions::start(&pool, exec.id, executor_id, Utc::now()).await.unwrap();
    assert_eq!(started, 1);

    let completed = executions::complete(
        &pool, exec.id, ExecutionStatus::Success, Some(&json!({"ok": true})), None, None, Utc::now(),
    ).await.unwrap();
    assert_eq!(completed, 1);

    let fetched = executions::get_execution(&pool, exec.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, ExecutionStatus::Success);
    assert!(fetched.duration_ms.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn double_start_is_a_no_op_on_the_second_call() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, executor_id) = seed_task_and_executor(&pool).await;

    let exec = executions::insert_pending(&pool, task_id, Utc::now(), 2).await.unwrap();

    let first = executions::start(&pool, exec.id, executor_id, Utc::now()).await.unwrap();
    assert_eq!(first, 1);

    let second = executions::start(&pool, exec.id, executor_id, Utc::now()).await.unwrap();
    assert_eq!(second, 0, "starting a running execution again must not re-apply");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_is_blocked_once_max_retries_reached() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, executor_id) = seed_task_and_executor(&pool).await;

    let exec = executions::insert_pending(&pool, task_id, Utc::now(), 1).await.unwrap();
    executions::start(&pool, exec.id, executor_id, Utc::now()).await.unwrap();
    executions::complete(&pool, exec.id, ExecutionStatus::Failed, None, None, Some("boom"), Utc::now())
        .await
        .unwrap();

    let retried = executions::retry(&pool, exec.id, 0).await.unwrap();
    assert_eq!(retried, 1);

    let after_retry = executions::get_execution(&pool, exec.id).await.unwrap().unwrap();
    assert_eq!(after_retry.status, ExecutionStatus::Pending);
    assert_eq!(after_retry.retry_count, 1);

    executions::start(&pool, exec.id, executor_id, Utc::now()).await.unwrap();
    executions::complete(&pool, exec.id, ExecutionStatus::Failed, None, None, Some("boom again"), Utc::now())
        .await
        .unwrap();

    // max_retries = 1, retry_count is now 1 -- a second retry must be rejected.
    let blocked = executions::retry(&pool, exec.id, 1).await.unwrap();
    assert_eq!(blocked, 0, "retry must not exceed max_retries");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_allowed_from_pending_and_running() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, executor_id) = seed_task_and_executor(&pool).await;

    let pending = executions::insert_pending(&pool, task_id, Utc::now(), 0).await.unwrap();
    let cancelled = executions::cancel(&pool, pending.id, "superseded", Utc::now()).await.unwrap();
    assert_eq!(cancelled, 1);

    let running = executions::insert_pending(&pool, task_id, Utc::now(), 0).await.unwrap();
    executions::start(&pool, running.id, executor_id, Utc::now()).await.unwrap();
    let cancelled2 = executions::cancel(&pool, running.id, "leadership lost", Utc::now()).await.unwrap();
    assert_eq!(cancelled2, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_overdue_running_finds_expired_deadline() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, executor_id) = seed_task_and_executor(&pool).await;

    let exec = executions::insert_pending(&pool, task_id, Utc::now(), 0).await.unwrap();
    let long_ago = Utc::now() - chrono::Duration::seconds(3600);
    executions::start(&pool, exec.id, executor_id, long_ago).await.unwrap();

    let overdue = executions::list_overdue_running(&pool, Utc::now()).await.unwrap();
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].id, exec.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn insert_skipped_produces_a_terminal_row_directly() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, _executor_id) = seed_task_and_executor(&pool).await;

    let skipped = executions::insert_skipped(&pool, task_id, Utc::now(), 0, "prior run still active")
        .await
        .unwrap();

    assert_eq!(skipped.status, ExecutionStatus::Skipped);
    assert!(skipped.status.is_terminal());
    assert_eq!(skipped.error.as_deref(), Some("prior run still active"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

//! Integration tests for the Dispatcher's retry-and-redispatch path
//! (spec.md §4.9, §4.10) and the Callback Handler (spec.md §4.11), against
//! a fake [`ExecutorClient`] so no live executor HTTP server is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::callback::{CallbackHandler, CallbackPayload, CallbackStatus};
use scheduler_core::client::{DispatchOutcome, DispatchRequest, ExecutorClient};
use scheduler_core::dispatch::Dispatcher;
use scheduler_core::execution;
use scheduler_db::models::{ExecutionMode, ExecutionStatus, ExecutorStatus, LoadBalanceStrategy};
use scheduler_db::queries::{assignments, executions as executions_db, executors, tasks};
use scheduler_test_utils::{create_test_db, drop_test_db};
use serde_json::json;

/// An [`ExecutorClient`] whose dispatch outcome is fixed up front and whose
/// call count is observable, standing in for a live executor over HTTP.
struct FakeClient {
    outcome: DispatchOutcome,
    dispatch_calls: AtomicUsize,
}

impl FakeClient {
    fn new(outcome: DispatchOutcome) -> Self {
        Self { outcome, dispatch_calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl ExecutorClient for FakeClient {
    async fn dispatch(&self, _base_url: &str, _request: &DispatchRequest, _timeout: Duration) -> DispatchOutcome {
        self.dispatch_calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }

    async fn health_check(&self, _health_check_url: &str, _timeout: Duration) -> bool {
        true
    }

    async fn stop(&self, _base_url: &str, _execution_id: uuid::Uuid) {}
}

/// An [`ExecutorClient`] that reports `Unreachable` on its first call and
/// `Accepted` on every call after, standing in for an executor that is down
/// when first selected and a healthy replacement thereafter.
struct FlakyThenAcceptingClient {
    dispatch_calls: AtomicUsize,
}

impl FlakyThenAcceptingClient {
    fn new() -> Self {
        Self { dispatch_calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl ExecutorClient for FlakyThenAcceptingClient {
    async fn dispatch(&self, _base_url: &str, _request: &DispatchRequest, _timeout: Duration) -> DispatchOutcome {
        if self.dispatch_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            DispatchOutcome::Unreachable("connection refused".into())
        } else {
            DispatchOutcome::Accepted
        }
    }

    async fn health_check(&self, _health_check_url: &str, _timeout: Duration) -> bool {
        true
    }

    async fn stop(&self, _base_url: &str, _execution_id: uuid::Uuid) {}
}

async fn seed_task_and_executor(pool: &sqlx::PgPool) -> (uuid::Uuid, uuid::Uuid) {
    let task = tasks::insert_task(
        pool, "job", "* * * * *", &json!({}), ExecutionMode::Parallel, LoadBalanceStrategy::RoundRobin, 3, 30,
    )
    .await
    .unwrap();
    let executor = executors::insert_executor(pool, "exec-1", "worker", "http://worker:9000", "http://worker:9000/health", &json!({}))
        .await
        .unwrap();
    assignments::upsert_assignment(pool, task.id, "worker", 0, 1).await.unwrap();
    (task.id, executor.id)
}

async fn wait_until<F>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn accepted_dispatch_transitions_the_execution_to_running() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, _executor_id) = seed_task_and_executor(&pool).await;
    let task = tasks::get_task(&pool, task_id).await.unwrap().unwrap();

    let client: Arc<dyn ExecutorClient> = Arc::new(FakeClient::new(DispatchOutcome::Accepted));
    let dispatcher = Dispatcher::new(pool.clone(), client, "http://scheduler:8080".into(), Duration::from_millis(5), Duration::from_secs(1));

    let pending = execution::create(&pool, task_id, Utc::now(), task.max_retry).await.unwrap();
    dispatcher.dispatch(&task, &pending).await.unwrap();

    let fetched = executions_db::get_execution(&pool, pending.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, ExecutionStatus::Running);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn a_rejected_dispatch_is_retried_and_re_enters_the_dispatcher() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, _executor_id) = seed_task_and_executor(&pool).await;
    let task = tasks::get_task(&pool, task_id).await.unwrap().unwrap();

    let client = Arc::new(FakeClient::new(DispatchOutcome::Rejected("no capacity".into())));
    let dispatcher = Dispatcher::new(
        pool.clone(),
        client.clone() as Arc<dyn ExecutorClient>,
        "http://scheduler:8080".into(),
        Duration::from_millis(5),
        Duration::from_millis(50),
    );

    let pending = execution::create(&pool, task_id, Utc::now(), task.max_retry).await.unwrap();
    dispatcher.dispatch(&task, &pending).await.unwrap();

    let failed = executions_db::get_execution(&pool, pending.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);

    // The retry is scheduled on a detached timer; give it room to fire and
    // re-dispatch, which transitions the execution back to running.
    let execution_id = pending.id;
    let pool_for_check = pool.clone();
    let ok = wait_until(
        move || {
            let pool = pool_for_check.clone();
            Box::pin(async move {
                matches!(
                    executions_db::get_execution(&pool, execution_id).await.unwrap().map(|e| e.status),
                    Some(ExecutionStatus::Running)
                )
            })
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(ok, "expected the retried execution to be re-dispatched back to running");
    assert!(client.dispatch_calls.load(Ordering::SeqCst) >= 2, "dispatch must have been called again for the retry");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retries_stop_once_max_retries_is_reached() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(
        &pool, "never-retries", "* * * * *", &json!({}), ExecutionMode::Parallel, LoadBalanceStrategy::RoundRobin, 0, 30,
    )
    .await
    .unwrap();
    let executor = executors::insert_executor(&pool, "exec-1", "worker", "http://worker:9000", "http://worker:9000/health", &json!({}))
        .await
        .unwrap();
    assignments::upsert_assignment(&pool, task.id, "worker", 0, 1).await.unwrap();
    let _ = executor;

    let client = Arc::new(FakeClient::new(DispatchOutcome::Rejected("no capacity".into())));
    let dispatcher = Dispatcher::new(
        pool.clone(),
        client.clone() as Arc<dyn ExecutorClient>,
        "http://scheduler:8080".into(),
        Duration::from_millis(5),
        Duration::from_millis(50),
    );

    let pending = execution::create(&pool, task.id, Utc::now(), task.max_retry).await.unwrap();
    dispatcher.dispatch(&task, &pending).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let final_state = executions_db::get_execution(&pool, pending.id).await.unwrap().unwrap();
    assert_eq!(final_state.status, ExecutionStatus::Failed, "max_retry=0 must leave the execution failed, never retried");
    assert_eq!(client.dispatch_calls.load(Ordering::SeqCst), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn callback_rejects_when_the_execution_is_not_running() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, _executor_id) = seed_task_and_executor(&pool).await;
    let task = tasks::get_task(&pool, task_id).await.unwrap().unwrap();

    let client: Arc<dyn ExecutorClient> = Arc::new(FakeClient::new(DispatchOutcome::Accepted));
    let dispatcher = Dispatcher::new(pool.clone(), client, "http://scheduler:8080".into(), Duration::from_millis(5), Duration::from_secs(1));
    let handler = CallbackHandler::new(dispatcher);

    let pending = execution::create(&pool, task_id, Utc::now(), task.max_retry).await.unwrap();
    let payload = CallbackPayload { status: CallbackStatus::Success, result: None, logs: None, error: None, end_time: None };

    let err = handler.handle(pending.id, &payload).await.unwrap_err();
    assert!(matches!(err, scheduler_core::error::SchedulerError::Conflict(_)));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn a_successful_callback_completes_the_execution() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, executor_id) = seed_task_and_executor(&pool).await;
    let task = tasks::get_task(&pool, task_id).await.unwrap().unwrap();

    let client: Arc<dyn ExecutorClient> = Arc::new(FakeClient::new(DispatchOutcome::Accepted));
    let dispatcher = Dispatcher::new(pool.clone(), client, "http://scheduler:8080".into(), Duration::from_millis(5), Duration::from_secs(1));
    let handler = CallbackHandler::new(dispatcher);

    let pending = execution::create(&pool, task_id, Utc::now(), task.max_retry).await.unwrap();
    execution::start(&pool, pending.id, executor_id).await.unwrap();

    let payload = CallbackPayload {
        status: CallbackStatus::Success,
        result: Some(json!({"ok": true})),
        logs: Some("done".into()),
        error: None,
        end_time: None,
    };
    handler.handle(pending.id, &payload).await.unwrap();

    let fetched = executions_db::get_execution(&pool, pending.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, ExecutionStatus::Success);
    assert_eq!(fetched.result, Some(json!({"ok": true})));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn a_failed_callback_schedules_a_retry() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, executor_id) = seed_task_and_executor(&pool).await;
    let task = tasks::get_task(&pool, task_id).await.unwrap().unwrap();

    let client: Arc<dyn ExecutorClient> = Arc::new(FakeClient::new(DispatchOutcome::Accepted));
    let dispatcher = Dispatcher::new(pool.clone(), client, "http://scheduler:8080".into(), Duration::from_millis(5), Duration::from_millis(50));
    let handler = CallbackHandler::new(dispatcher);

    let pending = execution::create(&pool, task_id, Utc::now(), task.max_retry).await.unwrap();
    execution::start(&pool, pending.id, executor_id).await.unwrap();

    let payload = CallbackPayload { status: CallbackStatus::Failed, result: None, logs: None, error: Some("boom".into()), end_time: None };
    handler.handle(pending.id, &payload).await.unwrap();

    let execution_id = pending.id;
    let pool_for_check = pool.clone();
    let ok = wait_until(
        move || {
            let pool = pool_for_check.clone();
            Box::pin(async move {
                executions_db::get_execution(&pool, execution_id)
                    .await
                    .unwrap()
                    .map(|e| e.retry_count > 0)
                    .unwrap_or(false)
            })
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(ok, "a failed callback must increment retry_count once the backoff timer fires");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unreachable_executor_is_marked_offline_and_reselected_without_a_retry() {
    let (pool, db_name) = create_test_db().await;
    let task = tasks::insert_task(
        &pool, "job", "* * * * *", &json!({}), ExecutionMode::Parallel, LoadBalanceStrategy::RoundRobin, 3, 30,
    )
    .await
    .unwrap();
    let down = executors::insert_executor(&pool, "exec-down", "down", "http://down:9000", "http://down:9000/health", &json!({}))
        .await
        .unwrap();
    let backup = executors::insert_executor(&pool, "exec-backup", "backup", "http://backup:9000", "http://backup:9000/health", &json!({}))
        .await
        .unwrap();
    assignments::upsert_assignment(&pool, task.id, "down", 0, 1).await.unwrap();
    assignments::upsert_assignment(&pool, task.id, "backup", 0, 1).await.unwrap();

    let client = Arc::new(FlakyThenAcceptingClient::new());
    let dispatcher = Dispatcher::new(pool.clone(), client.clone() as Arc<dyn ExecutorClient>, "http://scheduler:8080".into(), Duration::from_secs(60), Duration::from_secs(60));

    let pending = execution::create(&pool, task.id, Utc::now(), task.max_retry).await.unwrap();
    dispatcher.dispatch(&task, &pending).await.unwrap();

    // Accepted on the re-selected executor: running, retry_count untouched.
    let fetched = executions_db::get_execution(&pool, pending.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, ExecutionStatus::Running);
    assert_eq!(fetched.retry_count, 0, "the free re-selection must not consume the retry budget");
    assert_eq!(fetched.executor_id, Some(backup.id), "the execution must have been reassigned to the healthy executor");

    let down_after = executors::get_executor(&pool, down.id).await.unwrap().unwrap();
    assert_eq!(down_after.status, ExecutorStatus::Offline, "the unreachable executor must be marked offline");

    assert_eq!(client.dispatch_calls.load(Ordering::SeqCst), 2, "expected one failed attempt and one re-selected attempt");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn unreachable_executor_with_no_replacement_falls_through_to_normal_retry() {
    let (pool, db_name) = create_test_db().await;
    let (task_id, executor_id) = seed_task_and_executor(&pool).await;
    let task = tasks::get_task(&pool, task_id).await.unwrap().unwrap();

    let client: Arc<dyn ExecutorClient> = Arc::new(FakeClient::new(DispatchOutcome::Unreachable("connection refused".into())));
    let dispatcher = Dispatcher::new(pool.clone(), client, "http://scheduler:8080".into(), Duration::from_millis(5), Duration::from_millis(50));

    let pending = execution::create(&pool, task_id, Utc::now(), task.max_retry).await.unwrap();
    dispatcher.dispatch(&task, &pending).await.unwrap();

    let failed = executions_db::get_execution(&pool, pending.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);

    let down_after = executors::get_executor(&pool, executor_id).await.unwrap().unwrap();
    assert_eq!(down_after.status, ExecutorStatus::Offline);

    // With no other assigned executor, the normal retry-budget path applies:
    // a backoff timer is scheduled just as it is for an ordinary Rejected.
    let execution_id = pending.id;
    let pool_for_check = pool.clone();
    let ok = wait_until(
        move || {
            let pool = pool_for_check.clone();
            Box::pin(async move {
                executions_db::get_execution(&pool, execution_id)
                    .await
                    .unwrap()
                    .map(|e| e.retry_count > 0)
                    .unwrap_or(false)
            })
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(ok, "exhausting the one free re-selection must still schedule a normal retry");

    pool.close().await;
    drop_test_db(&db_name).await;
}

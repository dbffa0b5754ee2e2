//! Integration tests for executor registration, health tracking, and the
//! candidate-set query used by the load balancer.

use scheduler_db::models::ExecutorStatus;
use scheduler_db::queries::{assignments, executors, tasks};
use scheduler_db::models::{ExecutionMode, LoadBalanceStrategy};
use scheduler_test_utils::{create_test_db, drop_test_db};
use serde_json::json;

#[tokio::test]
async fn insert_and_fetch_round_trip() {
    let (pool, db_name) = create_test_db().await;

    let executor = executors::insert_executor(
        &pool,
        "exec-1",
        "worker-a",
        "http://worker-a:9000",
        "http://worker-a:9000/health",
        &json!({"region": "us-east"}),
    )
    .await
    .expect("insert should succeed");

    assert_eq!(executor.status, ExecutorStatus::Online);
    assert!(executor.is_healthy);
    assert_eq!(executor.consecutive_health_failures, 0);

    let fetched = executors::get_executor_by_name(&pool, "worker-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.id, executor.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn repeated_health_failures_flip_to_offline() {
    let (pool, db_name) = create_test_db().await;

    let executor = executors::insert_executor(
        &pool, "exec-2", "worker-b", "http://worker-b:9000", "http://worker-b:9000/health", &json!({}),
    ).await.unwrap();

    let threshold = 3;
    let now = chrono::Utc::now();

    for i in 1..threshold {
        let updated = executors::record_health_check(&pool, executor.id, false, threshold, now)
            .await
            .unwrap();
        assert_eq!(updated.consecutive_health_failures, i);
        assert!(updated.is_healthy, "should stay healthy below the threshold");
        assert_eq!(updated.status, ExecutorStatus::Online);
    }

    let tripped = executors::record_health_check(&pool, executor.id, false, threshold, now)
        .await
        .unwrap();
    assert_eq!(tripped.consecutive_health_failures, threshold);
    assert!(!tripped.is_healthy);
    assert_eq!(tripped.status, ExecutorStatus::Offline);

    // A later successful probe resets the failure counter and `is_healthy`,
    // but does not put the executor back into rotation on its own -- an
    // operator has to bring an `offline` executor back (spec.md §188).
    let probed_again = executors::record_health_check(&pool, executor.id, true, threshold, now)
        .await
        .unwrap();
    assert!(probed_again.is_healthy);
    assert_eq!(probed_again.consecutive_health_failures, 0);
    assert_eq!(probed_again.status, ExecutorStatus::Offline, "status must stay offline until an operator clears it");

    let restored = executors::set_executor_status(&pool, executor.id, ExecutorStatus::Online).await.unwrap();
    assert_eq!(restored, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_healthy_assigned_executors_orders_by_priority_then_id() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(
        &pool, "fanout", "* * * * *", &json!({}),
        ExecutionMode::Parallel, LoadBalanceStrategy::RoundRobin, 0, 60,
    ).await.unwrap();

    let low = executors::insert_executor(
        &pool, "exec-low", "low-priority", "http://low:9000", "http://low:9000/health", &json!({}),
    ).await.unwrap();
    let high = executors::insert_executor(
        &pool, "exec-high", "high-priority", "http://high:9000", "http://high:9000/health", &json!({}),
    ).await.unwrap();
    let unhealthy = executors::insert_executor(
        &pool, "exec-unhealthy", "unhealthy", "http://bad:9000", "http://bad:9000/health", &json!({}),
    ).await.unwrap();

    assignments::upsert_assignment(&pool, task.id, "low-priority", 1, 1).await.unwrap();
    assignments::upsert_assignment(&pool, task.id, "high-priority", 10, 1).await.unwrap();
    assignments::upsert_assignment(&pool, task.id, "unhealthy", 10, 1).await.unwrap();

    executors::set_executor_status(&pool, unhealthy.id, ExecutorStatus::Offline)
        .await
        .unwrap();

    let candidates = executors::list_healthy_assigned_executors(&pool, task.id)
        .await
        .unwrap();

    let ids: Vec<_> = candidates.iter().map(|(e, _, _)| e.id).collect();
    assert_eq!(ids, vec![high.id, low.id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

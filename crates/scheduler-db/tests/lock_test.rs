//! Integration tests for the distributed lock backing leader election
//! (spec.md §4.1).

use chrono::{Duration, Utc};
use scheduler_db::queries::lock;
use scheduler_test_utils::{create_test_db, drop_test_db};

const LEADER_KEY: &str = "scheduler:leader";

#[tokio::test]
async fn second_owner_cannot_acquire_an_unexpired_lock() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    let acquired = lock::try_acquire(&pool, LEADER_KEY, "instance-a", now + Duration::seconds(30), now)
        .await
        .unwrap();
    assert!(acquired);

    let contended = lock::try_acquire(&pool, LEADER_KEY, "instance-b", now + Duration::seconds(30), now)
        .await
        .unwrap();
    assert!(!contended, "a live lock must not be reclaimable by another owner");

    assert!(lock::is_owner(&pool, LEADER_KEY, "instance-a", now).await.unwrap());
    assert!(!lock::is_owner(&pool, LEADER_KEY, "instance-b", now).await.unwrap());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn expired_lock_can_be_reclaimed_by_a_new_owner() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    lock::try_acquire(&pool, LEADER_KEY, "instance-a", now - Duration::seconds(1), now - Duration::seconds(10))
        .await
        .unwrap();

    let reclaimed = lock::try_acquire(&pool, LEADER_KEY, "instance-b", now + Duration::seconds(30), now)
        .await
        .unwrap();
    assert!(reclaimed, "an expired lock must be reclaimable");
    assert!(lock::is_owner(&pool, LEADER_KEY, "instance-b", now).await.unwrap());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn refresh_requires_current_ownership() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    lock::try_acquire(&pool, LEADER_KEY, "instance-a", now + Duration::seconds(10), now)
        .await
        .unwrap();

    let refreshed = lock::refresh(&pool, LEADER_KEY, "instance-a", now + Duration::seconds(60))
        .await
        .unwrap();
    assert!(refreshed);

    let stolen_refresh = lock::refresh(&pool, LEADER_KEY, "instance-b", now + Duration::seconds(60))
        .await
        .unwrap();
    assert!(!stolen_refresh, "refresh must fail for a non-owner");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn release_then_reacquire_by_another_owner() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    lock::try_acquire(&pool, LEADER_KEY, "instance-a", now + Duration::seconds(30), now)
        .await
        .unwrap();

    lock::release(&pool, LEADER_KEY, "instance-a").await.unwrap();

    let reacquired = lock::try_acquire(&pool, LEADER_KEY, "instance-b", now + Duration::seconds(30), now)
        .await
        .unwrap();
    assert!(reacquired);

    pool.close().await;
    drop_test_db(&db_name).await;
}

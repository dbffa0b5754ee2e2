//! Database query functions for the `scheduler_instances` table (spec.md §3
//! "Scheduler Instance", §4.2 the Instance Registry).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::SchedulerInstance;

/// Register or re-register an instance on startup (spec.md §4.2 "upsert on
/// startup").
pub async fn upsert(pool: &PgPool, instance_id: &str, host: &str, port: i32) -> Result<SchedulerInstance> {
    let instance = sqlx::query_as::<_, SchedulerInstance>(
        "INSERT INTO scheduler_instances (instance_id, host, port, last_heartbeat, started_at) \
         VALUES ($1, $2, $3, now(), now()) \
         ON CONFLICT (instance_id) DO UPDATE \
             SET host = EXCLUDED.host, port = EXCLUDED.port, last_heartbeat = now() \
         RETURNING *",
    )
    .bind(instance_id)
    .bind(host)
    .bind(port)
    .fetch_one(pool)
    .await
    .context("failed to upsert scheduler instance")?;

    Ok(instance)
}

/// Update an instance's heartbeat timestamp (spec.md §4.2, default interval
/// 30s).
pub async fn heartbeat(pool: &PgPool, instance_id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE scheduler_instances SET last_heartbeat = now() WHERE instance_id = $1")
        .bind(instance_id)
        .execute(pool)
        .await
        .context("failed to record heartbeat")?;

    Ok(result.rows_affected())
}

/// Mark an instance as leader, recording `leader_elected_at` (spec.md §4.3).
pub async fn set_leader(pool: &PgPool, instance_id: &str, elected_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "UPDATE scheduler_instances SET is_leader = true, leader_elected_at = $2 WHERE instance_id = $1",
    )
    .bind(instance_id)
    .bind(elected_at)
    .execute(pool)
    .await
    .context("failed to mark instance as leader")?;

    Ok(())
}

/// Clear the leader flag on step-down (spec.md §4.3).
pub async fn clear_leader(pool: &PgPool, instance_id: &str) -> Result<()> {
    sqlx::query("UPDATE scheduler_instances SET is_leader = false WHERE instance_id = $1")
        .bind(instance_id)
        .execute(pool)
        .await
        .context("failed to clear leader flag")?;

    Ok(())
}

/// List instances whose heartbeat is within `stale_threshold` of `now`
/// (spec.md §4.2 "list healthy instances").
pub async fn list_healthy(
    pool: &PgPool,
    now: DateTime<Utc>,
    stale_threshold: chrono::Duration,
) -> Result<Vec<SchedulerInstance>> {
    let cutoff = now - stale_threshold;
    let instances = sqlx::query_as::<_, SchedulerInstance>(
        "SELECT * FROM scheduler_instances WHERE last_heartbeat >= $1 ORDER BY instance_id ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list healthy instances")?;

    Ok(instances)
}

/// Purge instance rows whose heartbeat is older than `cutoff` (spec.md
/// §4.13 step 3, default 24h).
pub async fn purge_stale(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM scheduler_instances WHERE last_heartbeat < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("failed to purge stale scheduler instances")?;

    Ok(result.rows_affected())
}

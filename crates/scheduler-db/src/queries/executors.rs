//! Database query functions for the `executors` table (spec.md §3 "Executor").

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::models::{Executor, ExecutorStatus};

/// Register a new executor.
pub async fn insert_executor(
    pool: &PgPool,
    instance_id: &str,
    name: &str,
    base_url: &str,
    health_check_url: &str,
    metadata: &Value,
) -> Result<Executor> {
    let executor = sqlx::query_as::<_, Executor>(
        "INSERT INTO executors (instance_id, name, base_url, health_check_url, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(instance_id)
    .bind(name)
    .bind(base_url)
    .bind(health_check_url)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert executor")?;

    Ok(executor)
}

pub async fn get_executor(pool: &PgPool, id: Uuid) -> Result<Option<Executor>> {
    let executor = sqlx::query_as::<_, Executor>("SELECT * FROM executors WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch executor")?;

    Ok(executor)
}

pub async fn get_executor_by_name(pool: &PgPool, name: &str) -> Result<Option<Executor>> {
    let executor = sqlx::query_as::<_, Executor>("SELECT * FROM executors WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch executor by name")?;

    Ok(executor)
}

pub async fn list_executors(pool: &PgPool) -> Result<Vec<Executor>> {
    let executors = sqlx::query_as::<_, Executor>("SELECT * FROM executors ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .context("failed to list executors")?;

    Ok(executors)
}

/// List executors that are both online in status and currently healthy,
/// ordered by `(priority DESC, id ASC)` joined against a task's
/// assignments -- the candidate set `E` for the Executor Selector
/// (spec.md §4.6).
pub async fn list_healthy_assigned_executors(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Vec<(Executor, i32, i32)>> {
    let rows = sqlx::query(
        "SELECT e.*, ta.priority, ta.weight \
         FROM executors e \
         JOIN task_assignments ta ON ta.executor_name = e.name \
         WHERE ta.task_id = $1 \
           AND e.status = 'online' \
           AND e.is_healthy = true \
         ORDER BY ta.priority DESC, e.id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list healthy assigned executors")?;

    let executors = rows
        .into_iter()
        .map(|row| {
            let executor = Executor::from_row(&row)?;
            let priority: i32 = row.try_get("priority")?;
            let weight: i32 = row.try_get("weight")?;
            Ok((executor, priority, weight))
        })
        .collect::<sqlx::Result<Vec<_>>>()
        .context("failed to decode healthy assigned executors")?;

    Ok(executors)
}

/// Mark the outcome of a health probe: on success resets the failure
/// counter; on failure increments it and flips to offline once the
/// threshold is reached (spec.md §4.12). An executor that has already
/// flipped to `offline` stays there until an operator brings it back --
/// this function never moves `status` off `offline` on its own (spec.md
/// §4.12, §188: recovery from `offline` is an operator action, not an
/// automatic one).
pub async fn record_health_check(
    pool: &PgPool,
    id: Uuid,
    healthy: bool,
    failure_threshold: i32,
    checked_at: chrono::DateTime<chrono::Utc>,
) -> Result<Executor> {
    let executor = if healthy {
        sqlx::query_as::<_, Executor>(
            "UPDATE executors \
             SET is_healthy = true, \
                 consecutive_health_failures = 0, \
                 last_health_check = $2, \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING *",
        )
        .bind(id)
        .bind(checked_at)
        .fetch_one(pool)
        .await
        .context("failed to record successful health check")?
    } else {
        sqlx::query_as::<_, Executor>(
            "UPDATE executors \
             SET consecutive_health_failures = consecutive_health_failures + 1, \
                 is_healthy = (consecutive_health_failures + 1) < $3, \
                 status = CASE WHEN (consecutive_health_failures + 1) >= $3 THEN 'offline' ELSE status END, \
                 last_health_check = $2, \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING *",
        )
        .bind(id)
        .bind(checked_at)
        .bind(failure_threshold)
        .fetch_one(pool)
        .await
        .context("failed to record failed health check")?
    };

    Ok(executor)
}

/// Set the executor's administrative status (e.g. `maintenance`).
pub async fn set_executor_status(pool: &PgPool, id: Uuid, status: ExecutorStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE executors SET status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set executor status")?;

    Ok(result.rows_affected())
}

/// List executors whose `last_health_check` is stale (older than
/// `interval`, or never checked), restricted to this instance's shard of
/// the keyspace (spec.md §4.12 sharding). Only `online` executors are
/// probed: `offline` ones are the Reconciler's job to deal with (spec.md
/// §188), and `maintenance` ones are deliberately excluded by an operator.
pub async fn list_executors_needing_health_check(
    pool: &PgPool,
    stale_before: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Executor>> {
    let executors = sqlx::query_as::<_, Executor>(
        "SELECT * FROM executors \
         WHERE status = 'online' \
           AND (last_health_check IS NULL OR last_health_check < $1) \
         ORDER BY id ASC",
    )
    .bind(stale_before)
    .fetch_all(pool)
    .await
    .context("failed to list executors needing health check")?;

    Ok(executors)
}

//! Database query functions for the `task_executions` table (spec.md §3
//! "Task Execution", §4.5 the execution state machine).
//!
//! Transitions use optimistic locking the same way the teacher's
//! `transition_task_status` does: the `UPDATE ... WHERE status = $from`
//! clause makes a racing concurrent transition a no-op (`rows_affected() ==
//! 0`) rather than a lost update.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{ExecutionStatus, TaskExecution};

/// Create a new execution in `pending` status for a firing at
/// `scheduled_time` (spec.md §4.5 `create()`).
///
/// Generic over [`PgExecutor`] (rather than a concrete `&PgPool`) so callers
/// that need the insert and its `created` domain event in one transaction
/// (spec.md §4.5, §9) can pass `&mut *tx` instead.
pub async fn insert_pending<'c, E: PgExecutor<'c>>(
    executor: E,
    task_id: Uuid,
    scheduled_time: DateTime<Utc>,
    max_retries: i32,
) -> Result<TaskExecution> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "INSERT INTO task_executions (task_id, status, scheduled_time, max_retries) \
         VALUES ($1, 'pending', $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(scheduled_time)
    .bind(max_retries)
    .fetch_one(executor)
    .await
    .context("failed to insert pending execution")?;

    Ok(execution)
}

/// Create an execution directly in `skipped` status, bypassing dispatch
/// entirely (spec.md §4.7 skip mode).
pub async fn insert_skipped<'c, E: PgExecutor<'c>>(
    executor: E,
    task_id: Uuid,
    scheduled_time: DateTime<Utc>,
    max_retries: i32,
    reason: &str,
) -> Result<TaskExecution> {
    let execution = sqlx::query_as::<_, TaskExecution>(
        "INSERT INTO task_executions \
            (task_id, status, scheduled_time, max_retries, error, start_time, end_time, duration_ms) \
         VALUES ($1, 'skipped', $2, $3, $4, now(), now(), 0) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(scheduled_time)
    .bind(max_retries)
    .bind(reason)
    .fetch_one(executor)
    .await
    .context("failed to insert skipped execution")?;

    Ok(execution)
}

pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<TaskExecution>> {
    let execution = sqlx::query_as::<_, TaskExecution>("SELECT * FROM task_executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch execution")?;

    Ok(execution)
}

/// List executions, most recent first, optionally filtered to one task
/// (admin HTTP `GET /api/v1/executions`, spec.md §4.14). Bounded to the
/// 200 most recent rows -- this is an operator-facing query, not a
/// pagination API.
pub async fn list_executions(pool: &PgPool, task_id: Option<Uuid>) -> Result<Vec<TaskExecution>> {
    let executions = match task_id {
        Some(task_id) => {
            sqlx::query_as::<_, TaskExecution>(
                "SELECT * FROM task_executions WHERE task_id = $1 ORDER BY scheduled_time DESC LIMIT 200",
            )
            .bind(task_id)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, TaskExecution>("SELECT * FROM task_executions ORDER BY scheduled_time DESC LIMIT 200")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list executions")?;

    Ok(executions)
}

/// List executions for a task in the given statuses, ordered oldest first.
pub async fn list_by_task_and_statuses(
    pool: &PgPool,
    task_id: Uuid,
    statuses: &[ExecutionStatus],
) -> Result<Vec<TaskExecution>> {
    let status_strings: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions \
         WHERE task_id = $1 AND status = ANY($2) \
         ORDER BY scheduled_time ASC",
    )
    .bind(task_id)
    .bind(&status_strings)
    .fetch_all(pool)
    .await
    .context("failed to list executions by task and statuses")?;

    Ok(executions)
}

/// Count currently `running` executions assigned to a given executor
/// (spec.md §4.6 least-loaded strategy's load metric).
pub async fn count_running_for_executor(pool: &PgPool, executor_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_executions WHERE executor_id = $1 AND status = 'running'",
    )
    .bind(executor_id)
    .fetch_one(pool)
    .await
    .context("failed to count running executions for executor")?;

    Ok(row.0)
}

/// Transition `pending -> running`, setting `executor_id` and `start_time`
/// (spec.md §4.5 "Only `pending -> running` may set executor_id and
/// start_time"). Generic so the caller can co-write the `started` domain
/// event in the same transaction.
pub async fn start<'c, E: PgExecutor<'c>>(
    executor: E,
    id: Uuid,
    executor_id: Uuid,
    start_time: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET status = 'running', executor_id = $2, start_time = $3, updated_at = now() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(id)
    .bind(executor_id)
    .bind(start_time)
    .execute(executor)
    .await
    .context("failed to start execution")?;

    Ok(result.rows_affected())
}

/// Move a still-`running` execution onto a different executor without
/// touching `retry_count` (spec.md §7 `ExecutorDown`: one free re-selection
/// when the originally-chosen executor turns out to be unreachable).
/// Scoped to the expected current `executor_id` so a racing watchdog
/// timeout wins the row instead of being silently overwritten.
pub async fn reassign_executor<'c, E: PgExecutor<'c>>(
    executor: E,
    id: Uuid,
    from_executor_id: Uuid,
    to_executor_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_executions \
         SET executor_id = $3, updated_at = now() \
         WHERE id = $1 AND status = 'running' AND executor_id = $2",
    )
    .bind(id)
    .bind(from_executor_id)
    .bind(to_executor_id)
    .execute(executor)
    .await
    .context("failed to reassign execution to a new executor")?;

    Ok(result.rows_affected())
}

/// Transition `running -> {success, failed}` and record the callback
/// payload (spec.md §4.5, §4.11). Generic so the caller can co-write the
/// completion domain event in the same transaction.
#[allow(clippy::too_many_arguments)]
pub async fn complete<'c, E: PgExecutor<'c>>(
    executor: E,
    id: Uuid,
    to: ExecutionStatus,
    result_payload: Option<&Value>,
    logs: Option<&str>,
    error: Option<&str>,
    end_time: DateTime<Utc>,
) -> Result<u64> {
    debug_assert!(matches!(to, ExecutionStatus::Success | ExecutionStatus::Failed));

    let rows = sqlx::query(
        "UPDATE task_executions \
         SET status = $2, \
             result = $3, \
             logs = COALESCE($4, logs), \
             error = COALESCE($5, error), \
             end_time = $6, \
             duration_ms = EXTRACT(EPOCH FROM ($6 - start_time)) * 1000, \
             updated_at = now() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .bind(to)
    .bind(result_payload)
    .bind(logs)
    .bind(error)
    .bind(end_time)
    .execute(executor)
    .await
    .context("failed to complete execution")?
    .rows_affected();

    Ok(rows)
}

/// Transition `running -> timeout` (spec.md §4.9 step 5, the watchdog).
/// Generic so the caller can co-write the `timed_out` domain event in the
/// same transaction.
pub async fn timeout<'c, E: PgExecutor<'c>>(
    executor: E,
    id: Uuid,
    end_time: DateTime<Utc>,
) -> Result<u64> {
    let rows = sqlx::query(
        "UPDATE task_executions \
         SET status = 'timeout', \
             error = 'execution timeout', \
             end_time = $2, \
             duration_ms = EXTRACT(EPOCH FROM ($2 - start_time)) * 1000, \
             updated_at = now() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(id)
    .bind(end_time)
    .execute(executor)
    .await
    .context("failed to time out execution")?
    .rows_affected();

    Ok(rows)
}

/// Transition `{pending, running} -> cancelled` (spec.md §4.5 "cancel is
/// also allowed from pending"). Generic so the caller can co-write the
/// `cancelled` domain event in the same transaction.
pub async fn cancel<'c, E: PgExecutor<'c>>(
    executor: E,
    id: Uuid,
    reason: &str,
    end_time: DateTime<Utc>,
) -> Result<u64> {
    let rows = sqlx::query(
        "UPDATE task_executions \
         SET status = 'cancelled', \
             error = $2, \
             end_time = $3, \
             duration_ms = EXTRACT(EPOCH FROM ($3 - COALESCE(start_time, $3))) * 1000, \
             updated_at = now() \
         WHERE id = $1 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .bind(reason)
    .bind(end_time)
    .execute(executor)
    .await
    .context("failed to cancel execution")?
    .rows_affected();

    Ok(rows)
}

/// Transition `{failed, timeout} -> pending`, incrementing `retry_count`
/// (spec.md §4.5 `retry()`). Optimistic-locks on the current
/// `retry_count` so a racing retry cannot double-increment. Generic so the
/// caller can co-write the `retried` domain event in the same transaction.
pub async fn retry<'c, E: PgExecutor<'c>>(
    executor: E,
    id: Uuid,
    current_retry_count: i32,
) -> Result<u64> {
    let rows = sqlx::query(
        "UPDATE task_executions \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             executor_id = NULL, \
             start_time = NULL, \
             end_time = NULL, \
             duration_ms = NULL, \
             updated_at = now() \
         WHERE id = $1 \
           AND status IN ('failed', 'timeout') \
           AND retry_count = $2 \
           AND retry_count < max_retries",
    )
    .bind(id)
    .bind(current_retry_count)
    .execute(executor)
    .await
    .context("failed to retry execution")?
    .rows_affected();

    Ok(rows)
}

/// List executions in `running` status whose deadline
/// (`start_time + timeout_seconds`) has passed -- input to the Dispatcher's
/// watchdog (spec.md §4.9 step 5).
pub async fn list_overdue_running(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT te.* FROM task_executions te \
         JOIN tasks t ON t.id = te.task_id \
         WHERE te.status = 'running' \
           AND te.start_time IS NOT NULL \
           AND te.start_time + (t.timeout_seconds || ' seconds')::interval < $1",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to list overdue running executions")?;

    Ok(executions)
}

/// List executions in `pending` status older than `older_than` (spec.md
/// §4.13 step 2, the Reconciler's grace window).
pub async fn list_stale_pending(
    pool: &PgPool,
    older_than: DateTime<Utc>,
) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT * FROM task_executions WHERE status = 'pending' AND created_at < $1",
    )
    .bind(older_than)
    .fetch_all(pool)
    .await
    .context("failed to list stale pending executions")?;

    Ok(executions)
}

/// List `running` executions whose assigned executor is missing, offline,
/// or unhealthy (spec.md §4.13 step 1, the Reconciler's orphan scan).
pub async fn list_running_with_unavailable_executor(pool: &PgPool) -> Result<Vec<TaskExecution>> {
    let executions = sqlx::query_as::<_, TaskExecution>(
        "SELECT te.* FROM task_executions te \
         LEFT JOIN executors e ON e.id = te.executor_id \
         WHERE te.status = 'running' \
           AND (e.id IS NULL OR e.status != 'online' OR e.is_healthy = false)",
    )
    .fetch_all(pool)
    .await
    .context("failed to list running executions with unavailable executor")?;

    Ok(executions)
}

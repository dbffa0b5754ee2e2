//! Database query functions for the `tasks` table (spec.md §3 "Task").

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ExecutionMode, LoadBalanceStrategy, Task, TaskStatus};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, status=active, created_at, updated_at).
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    name: &str,
    cron_expression: &str,
    parameters: &Value,
    execution_mode: ExecutionMode,
    load_balance_strategy: LoadBalanceStrategy,
    max_retry: i32,
    timeout_seconds: i32,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
            (name, cron_expression, parameters, execution_mode, load_balance_strategy, max_retry, timeout_seconds) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(name)
    .bind(cron_expression)
    .bind(parameters)
    .bind(execution_mode)
    .bind(load_balance_strategy)
    .bind(max_retry)
    .bind(timeout_seconds)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a single task by its unique name.
pub async fn get_task_by_name(pool: &PgPool, name: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task by name")?;

    Ok(task)
}

/// List all tasks, ordered by creation time.
pub async fn list_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    Ok(tasks)
}

/// List all tasks with `status = 'active'`, ordered by id (spec.md §4.8
/// step 2 and step 4's "priority order by task id").
pub async fn list_active_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'active' ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active tasks")?;

    Ok(tasks)
}

/// Update a task's status. Rejects the update if the task is already
/// `deleted` (soft-delete is terminal, spec.md §3).
pub async fn update_task_status(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = now() \
         WHERE id = $2 AND status != 'deleted'",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task status")?;

    Ok(result.rows_affected())
}

/// Set `last_checked_at` for a task (spec.md §4.8 step 3 / §4.13 step 4).
pub async fn set_last_checked_at(
    pool: &PgPool,
    id: Uuid,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET last_checked_at = $1, updated_at = now() WHERE id = $2")
        .bind(at)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set last_checked_at")?;

    Ok(())
}

/// Reset `last_checked_at` to `now` for every active task (spec.md §4.13
/// step 4, the Reconciler's "no catch-up replay" rule).
pub async fn reset_last_checked_at_for_active_tasks(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET last_checked_at = now(), updated_at = now() WHERE status = 'active'",
    )
    .execute(pool)
    .await
    .context("failed to reset last_checked_at for active tasks")?;

    Ok(result.rows_affected())
}

/// Delete (soft) a task: transition it to `deleted` unconditionally.
pub async fn soft_delete_task(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET status = 'deleted', updated_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to soft-delete task")?;

    Ok(result.rows_affected())
}

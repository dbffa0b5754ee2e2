//! Database query functions for the `task_assignments` table (spec.md §3
//! "Task↔Executor Assignment").

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskAssignment;

/// Assign an executor to a task. Idempotent on the `(task_id,
/// executor_name)` unique index: a repeat call updates priority/weight.
pub async fn upsert_assignment(
    pool: &PgPool,
    task_id: Uuid,
    executor_name: &str,
    priority: i32,
    weight: i32,
) -> Result<TaskAssignment> {
    let assignment = sqlx::query_as::<_, TaskAssignment>(
        "INSERT INTO task_assignments (task_id, executor_name, priority, weight) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (task_id, executor_name) \
         DO UPDATE SET priority = EXCLUDED.priority, weight = EXCLUDED.weight \
         RETURNING *",
    )
    .bind(task_id)
    .bind(executor_name)
    .bind(priority)
    .bind(weight)
    .fetch_one(pool)
    .await
    .context("failed to upsert task assignment")?;

    Ok(assignment)
}

pub async fn list_assignments_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskAssignment>> {
    let assignments = sqlx::query_as::<_, TaskAssignment>(
        "SELECT * FROM task_assignments WHERE task_id = $1 ORDER BY executor_name ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list assignments for task")?;

    Ok(assignments)
}

pub async fn remove_assignment(pool: &PgPool, task_id: Uuid, executor_name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM task_assignments WHERE task_id = $1 AND executor_name = $2")
        .bind(task_id)
        .bind(executor_name)
        .execute(pool)
        .await
        .context("failed to remove task assignment")?;

    Ok(result.rows_affected())
}

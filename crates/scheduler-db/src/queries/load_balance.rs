//! Database query functions for the `load_balance_states` table (spec.md §3
//! "Load-Balance State", §4.6 the five selection strategies).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::LoadBalanceState;

/// Fetch the load-balance state for a task, creating a default row
/// (`round_robin_index = 0`, no sticky/last executor) if none exists yet.
pub async fn get_or_create(pool: &PgPool, task_id: Uuid) -> Result<LoadBalanceState> {
    let state = sqlx::query_as::<_, LoadBalanceState>(
        "INSERT INTO load_balance_states (task_id) VALUES ($1) \
         ON CONFLICT (task_id) DO UPDATE SET task_id = EXCLUDED.task_id \
         RETURNING *",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to get or create load balance state")?;

    Ok(state)
}

/// Advance the round-robin cursor to `new_index` and record the chosen
/// executor as `last_executor_id`.
pub async fn advance_round_robin(
    pool: &PgPool,
    task_id: Uuid,
    new_index: i64,
    chosen_executor_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "UPDATE load_balance_states \
         SET round_robin_index = $2, last_executor_id = $3, updated_at = now() \
         WHERE task_id = $1",
    )
    .bind(task_id)
    .bind(new_index)
    .bind(chosen_executor_id)
    .execute(pool)
    .await
    .context("failed to advance round robin state")?;

    Ok(())
}

/// Record the sticky executor chosen for a task (spec.md §4.6 sticky
/// strategy: "persists across runs of the task until that executor leaves
/// E").
pub async fn set_sticky(pool: &PgPool, task_id: Uuid, executor_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE load_balance_states \
         SET sticky_executor_id = $2, updated_at = now() \
         WHERE task_id = $1",
    )
    .bind(task_id)
    .bind(executor_id)
    .execute(pool)
    .await
    .context("failed to set sticky executor")?;

    Ok(())
}

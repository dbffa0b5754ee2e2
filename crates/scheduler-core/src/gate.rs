//! Concurrency Gate (spec.md §4.7): enforces a task's execution-mode policy
//! against its currently non-terminal executions.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use scheduler_db::models::{ExecutionMode, ExecutionStatus};
use scheduler_db::queries::executions as db;

/// What the Dispatcher should do for a firing at instant `s`.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Proceed: create a new execution and dispatch it.
    Proceed,
    /// Create the execution directly in `skipped` with this reason; do not dispatch.
    Skip { reason: &'static str },
    /// Drop this tick's firing entirely; re-evaluate on the next tick.
    DropTick,
}

const NON_TERMINAL: &[ExecutionStatus] = &[ExecutionStatus::Pending, ExecutionStatus::Running];

/// Evaluate the gate for task `task_id` firing at instant `s`.
pub async fn evaluate(
    pool: &PgPool,
    task_id: Uuid,
    execution_mode: ExecutionMode,
    s: DateTime<Utc>,
) -> anyhow::Result<GateDecision> {
    if execution_mode == ExecutionMode::Parallel {
        return Ok(GateDecision::Proceed);
    }

    let running_before_s: Vec<_> = db::list_by_task_and_statuses(pool, task_id, NON_TERMINAL)
        .await?
        .into_iter()
        .filter(|e| e.scheduled_time < s)
        .collect();

    if running_before_s.is_empty() {
        return Ok(GateDecision::Proceed);
    }

    match execution_mode {
        ExecutionMode::Skip => Ok(GateDecision::Skip { reason: "concurrent run in progress" }),
        ExecutionMode::Sequential => Ok(GateDecision::DropTick),
        ExecutionMode::Parallel => unreachable!("handled above"),
    }
}

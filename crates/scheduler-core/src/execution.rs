//! Execution Aggregate (spec.md §4.5, §9): the state-machine entry points
//! for a `TaskExecution`, each opening one transaction so the status
//! mutation and its domain event land atomically.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use scheduler_db::models::{ExecutionStatus, TaskExecution};
use scheduler_db::queries::executions as db;

use crate::error::{Result, SchedulerError};
use crate::events::DomainEvent;

/// Create a new execution in `pending` status and append its `created`
/// domain event in the same transaction.
pub async fn create(
    pool: &PgPool,
    task_id: Uuid,
    scheduled_time: DateTime<Utc>,
    max_retries: i32,
) -> Result<TaskExecution> {
    let mut tx = pool.begin().await.map_err(|e| SchedulerError::Db(e.into()))?;

    let execution = db::insert_pending(&mut *tx, task_id, scheduled_time, max_retries)
        .await
        .map_err(SchedulerError::Db)?;

    DomainEvent::Created { execution_id: execution.id, task_id, scheduled_time }
        .record(&mut *tx)
        .await
        .map_err(SchedulerError::Db)?;

    tx.commit().await.map_err(|e| SchedulerError::Db(e.into()))?;
    Ok(execution)
}

/// Create an execution directly in `skipped` status (concurrency gate's
/// skip mode, spec.md §4.7) and record its `skipped` event.
pub async fn create_skipped(
    pool: &PgPool,
    task_id: Uuid,
    scheduled_time: DateTime<Utc>,
    max_retries: i32,
    reason: &str,
) -> Result<TaskExecution> {
    let mut tx = pool.begin().await.map_err(|e| SchedulerError::Db(e.into()))?;

    let execution = db::insert_skipped(&mut *tx, task_id, scheduled_time, max_retries, reason)
        .await
        .map_err(SchedulerError::Db)?;

    DomainEvent::Skipped { execution_id: execution.id, reason: reason.to_string() }
        .record(&mut *tx)
        .await
        .map_err(SchedulerError::Db)?;

    tx.commit().await.map_err(|e| SchedulerError::Db(e.into()))?;
    Ok(execution)
}

/// `pending -> running`. Returns [`SchedulerError::Conflict`] if the
/// execution was not in `pending` (lost the optimistic-lock race, or
/// already started/cancelled by another instance).
pub async fn start(pool: &PgPool, id: Uuid, executor_id: Uuid) -> Result<()> {
    let start_time = Utc::now();
    let mut tx = pool.begin().await.map_err(|e| SchedulerError::Db(e.into()))?;

    let rows = db::start(&mut *tx, id, executor_id, start_time).await.map_err(SchedulerError::Db)?;
    if rows == 0 {
        return Err(SchedulerError::Conflict(format!("execution {id} is not pending")));
    }

    DomainEvent::Started { execution_id: id, executor_id, start_time }
        .record(&mut *tx)
        .await
        .map_err(SchedulerError::Db)?;

    tx.commit().await.map_err(|e| SchedulerError::Db(e.into()))?;
    Ok(())
}

/// Reassign a `running` execution to a freshly-selected executor after the
/// original went unreachable mid-dispatch (spec.md §7 `ExecutorDown`).
/// Leaves `retry_count` untouched -- this is the one free re-selection, not
/// a retry.
pub async fn reassign(pool: &PgPool, id: Uuid, from_executor_id: Uuid, to_executor_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await.map_err(|e| SchedulerError::Db(e.into()))?;

    let rows = db::reassign_executor(&mut *tx, id, from_executor_id, to_executor_id).await.map_err(SchedulerError::Db)?;
    if rows == 0 {
        return Err(SchedulerError::Conflict(format!("execution {id} is no longer running on executor {from_executor_id}")));
    }

    DomainEvent::Reassigned { execution_id: id, from_executor_id, to_executor_id }
        .record(&mut *tx)
        .await
        .map_err(SchedulerError::Db)?;

    tx.commit().await.map_err(|e| SchedulerError::Db(e.into()))?;
    Ok(())
}

/// `running -> {success, failed}` from a callback or dispatch-level failure.
#[allow(clippy::too_many_arguments)]
pub async fn complete(
    pool: &PgPool,
    id: Uuid,
    to: ExecutionStatus,
    result: Option<&Value>,
    logs: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    debug_assert!(matches!(to, ExecutionStatus::Success | ExecutionStatus::Failed));
    let end_time = Utc::now();
    let mut tx = pool.begin().await.map_err(|e| SchedulerError::Db(e.into()))?;

    let rows = db::complete(&mut *tx, id, to, result, logs, error, end_time).await.map_err(SchedulerError::Db)?;
    if rows == 0 {
        return Err(SchedulerError::Conflict(format!("execution {id} is not running")));
    }

    let event = match to {
        ExecutionStatus::Failed => {
            DomainEvent::Failed { execution_id: id, error: error.unwrap_or("unknown error").to_string() }
        }
        _ => DomainEvent::Completed { execution_id: id, status: to.to_string(), end_time },
    };
    event.record(&mut *tx).await.map_err(SchedulerError::Db)?;

    tx.commit().await.map_err(|e| SchedulerError::Db(e.into()))?;
    Ok(())
}

/// `running -> timeout` (the Dispatcher's watchdog, spec.md §4.9 step 5).
pub async fn timeout(pool: &PgPool, id: Uuid) -> Result<()> {
    let end_time = Utc::now();
    let mut tx = pool.begin().await.map_err(|e| SchedulerError::Db(e.into()))?;

    let rows = db::timeout(&mut *tx, id, end_time).await.map_err(SchedulerError::Db)?;
    if rows == 0 {
        return Err(SchedulerError::Conflict(format!("execution {id} is not running")));
    }

    DomainEvent::Failed { execution_id: id, error: "execution timeout".to_string() }
        .record(&mut *tx)
        .await
        .map_err(SchedulerError::Db)?;

    tx.commit().await.map_err(|e| SchedulerError::Db(e.into()))?;
    Ok(())
}

/// `{pending, running} -> cancelled`.
pub async fn cancel(pool: &PgPool, id: Uuid, reason: &str) -> Result<()> {
    let end_time = Utc::now();
    let mut tx = pool.begin().await.map_err(|e| SchedulerError::Db(e.into()))?;

    let rows = db::cancel(&mut *tx, id, reason, end_time).await.map_err(SchedulerError::Db)?;
    if rows == 0 {
        return Err(SchedulerError::Conflict(format!("execution {id} cannot be cancelled from its current status")));
    }

    DomainEvent::Cancelled { execution_id: id, reason: reason.to_string() }
        .record(&mut *tx)
        .await
        .map_err(SchedulerError::Db)?;

    tx.commit().await.map_err(|e| SchedulerError::Db(e.into()))?;
    Ok(())
}

/// `{failed, timeout} -> pending`, incrementing `retry_count`. Returns
/// [`SchedulerError::Validation`] once `retry_count` has reached
/// `max_retries` (spec.md §4.5, §4.10 exhaustion).
///
/// Takes the execution's id and current `retry_count`/`max_retries` rather
/// than a full [`TaskExecution`] so callers scheduling a retry after a
/// detached backoff timer (spec.md §4.10) don't need to keep the whole row
/// alive, only the fields the transition actually checks.
pub async fn retry(pool: &PgPool, id: Uuid, retry_count: i32, max_retries: i32) -> Result<()> {
    if retry_count >= max_retries {
        return Err(SchedulerError::Validation(format!("execution {id} has exhausted its {max_retries} retries")));
    }

    let mut tx = pool.begin().await.map_err(|e| SchedulerError::Db(e.into()))?;

    let rows = db::retry(&mut *tx, id, retry_count).await.map_err(SchedulerError::Db)?;
    if rows == 0 {
        return Err(SchedulerError::Conflict(format!("execution {id} lost the retry race")));
    }

    DomainEvent::Retried { execution_id: id, retry_count: retry_count + 1 }
        .record(&mut *tx)
        .await
        .map_err(SchedulerError::Db)?;

    tx.commit().await.map_err(|e| SchedulerError::Db(e.into()))?;
    Ok(())
}

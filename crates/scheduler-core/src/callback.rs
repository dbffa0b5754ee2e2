//! Callback Handler (spec.md §4.11): the executor's side of the wire
//! protocol, invoked by the admin HTTP layer's
//! `POST /api/v1/executions/{id}/callback` route.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use scheduler_db::models::ExecutionStatus;
use scheduler_db::queries::executions as db;

use crate::dispatch::Dispatcher;
use crate::error::{Result, SchedulerError};
use crate::execution;

/// The `POST .../callback` request body (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub status: CallbackStatus,
    pub result: Option<Value>,
    pub logs: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Success,
    Failed,
    Timeout,
}

/// Wraps a [`Dispatcher`] so a failed or timed-out callback re-enters the
/// same retry-and-redispatch path the Dispatcher itself uses for rejected
/// and watchdog-timed-out executions (spec.md §4.10).
pub struct CallbackHandler {
    dispatcher: Dispatcher,
}

impl CallbackHandler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Process a callback for `execution_id`. Rejects with
    /// [`SchedulerError::Conflict`] if the execution is not `running`
    /// (spec.md §4.11: "rejects if not in running", and §8's "replayed
    /// callback is a no-op").
    pub async fn handle(&self, execution_id: Uuid, payload: &CallbackPayload) -> Result<()> {
        let pool = self.dispatcher.pool();
        let existing = db::get_execution(pool, execution_id)
            .await
            .map_err(SchedulerError::Db)?
            .ok_or_else(|| SchedulerError::not_found("execution", execution_id))?;

        if existing.status != ExecutionStatus::Running {
            return Err(SchedulerError::Conflict(format!(
                "execution {execution_id} is {} not running, callback rejected",
                existing.status
            )));
        }

        let to = match payload.status {
            CallbackStatus::Success => ExecutionStatus::Success,
            CallbackStatus::Failed => ExecutionStatus::Failed,
            CallbackStatus::Timeout => {
                execution::timeout(pool, execution_id).await?;
                return self.dispatcher.schedule_retry_for(execution_id, existing.retry_count, existing.max_retries);
            }
        };

        execution::complete(
            pool,
            execution_id,
            to,
            payload.result.as_ref(),
            payload.logs.as_deref(),
            payload.error.as_deref(),
        )
        .await?;

        if to == ExecutionStatus::Failed {
            return self.dispatcher.schedule_retry_for(execution_id, existing.retry_count, existing.max_retries);
        }

        Ok(())
    }
}

//! Dispatcher (spec.md §4.9) and Retry Policy (spec.md §4.10): selects an
//! executor for a pending execution, POSTs the work, and schedules a retry
//! on failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use scheduler_db::models::{ExecutionStatus, ExecutorStatus, Task, TaskExecution};
use scheduler_db::queries::executions as db;
use scheduler_db::queries::executors as executors_db;
use scheduler_db::queries::tasks as tasks_db;

use crate::client::{DispatchOutcome, DispatchRequest, ExecutorClient};
use crate::error::{Result, SchedulerError};
use crate::execution;
use crate::selector;

/// Compute the retry backoff for `retry_count` (spec.md §4.10:
/// `min(base * 2^retry_count, cap)`).
pub fn retry_backoff(retry_count: i32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(retry_count.max(0) as u32).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Build the callback URL the executor will POST its result to.
pub fn callback_url(scheduler_base: &str, execution_id: Uuid) -> String {
    format!("{scheduler_base}/api/v1/executions/{execution_id}/callback")
}

pub struct Dispatcher {
    pool: PgPool,
    client: Arc<dyn ExecutorClient>,
    scheduler_base: String,
    retry_base: Duration,
    retry_cap: Duration,
}

impl Dispatcher {
    pub fn new(pool: PgPool, client: Arc<dyn ExecutorClient>, scheduler_base: String, retry_base: Duration, retry_cap: Duration) -> Self {
        Self { pool, client, scheduler_base, retry_base, retry_cap }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Dispatch a freshly-pending execution for `task` (spec.md §4.9).
    pub async fn dispatch(&self, task: &Task, pending: &TaskExecution) -> Result<()> {
        let executor = match selector::select(&self.pool, task.id, task.load_balance_strategy).await {
            Ok(executor) => executor,
            Err(SchedulerError::NoExecutor { task_id }) => {
                // Stays pending; the next tick will try again (spec.md §4.9 step 1).
                info!(task_id = %task_id, "no healthy executor, leaving execution pending");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        execution::start(&self.pool, pending.id, executor.id).await?;

        let request = DispatchRequest {
            execution_id: pending.id,
            task_id: task.id,
            task_name: task.name.clone(),
            parameters: task.parameters.clone(),
            scheduled_time: pending.scheduled_time,
            callback_url: callback_url(&self.scheduler_base, pending.id),
            timeout_seconds: task.timeout_seconds,
            retry_count: pending.retry_count,
        };

        let timeout = Duration::from_secs(task.timeout_seconds.max(0) as u64);
        let outcome = self.client.dispatch(&executor.base_url, &request, timeout).await;

        if let DispatchOutcome::Unreachable(reason) = outcome {
            return self.handle_unreachable(task, pending, executor.id, &request, timeout, reason).await;
        }
        self.finish_dispatch(pending, executor.id, outcome).await
    }

    /// The executor that answered `select` turned out to be unreachable
    /// (spec.md §7 `ExecutorDown`): mark it offline, re-select once without
    /// touching `retry_count`, and retry the POST against the replacement.
    /// Only once that second attempt also fails does the ordinary
    /// retry-budget path apply.
    async fn handle_unreachable(
        &self,
        task: &Task,
        pending: &TaskExecution,
        down_executor_id: Uuid,
        request: &DispatchRequest,
        timeout: Duration,
        reason: String,
    ) -> Result<()> {
        warn!(execution_id = %pending.id, executor_id = %down_executor_id, %reason, "executor unreachable, marking offline and re-selecting once");
        let _ = executors_db::set_executor_status(&self.pool, down_executor_id, ExecutorStatus::Offline).await;

        match selector::select(&self.pool, task.id, task.load_balance_strategy).await {
            Ok(replacement) => {
                execution::reassign(&self.pool, pending.id, down_executor_id, replacement.id).await?;
                let outcome = self.client.dispatch(&replacement.base_url, request, timeout).await;
                self.finish_dispatch(pending, replacement.id, outcome).await
            }
            Err(SchedulerError::NoExecutor { .. }) => {
                let down = SchedulerError::ExecutorDown { executor_id: down_executor_id };
                warn!(execution_id = %pending.id, error = %down, "no replacement executor available after executor went down");
                execution::complete(&self.pool, pending.id, ExecutionStatus::Failed, None, None, Some(&down.to_string())).await?;
                self.maybe_schedule_retry(pending).await
            }
            Err(e) => Err(e),
        }
    }

    /// Apply the outcome of a dispatch POST and, on failure, run the
    /// retry-budget path (spec.md §4.10). Shared by the first attempt and
    /// the one free re-selection after `ExecutorDown`; a second
    /// `Unreachable` is treated as an ordinary failure rather than
    /// re-selecting again.
    async fn finish_dispatch(&self, pending: &TaskExecution, executor_id: Uuid, outcome: DispatchOutcome) -> Result<()> {
        match outcome {
            DispatchOutcome::Accepted => Ok(()),
            DispatchOutcome::Rejected(reason) => {
                warn!(execution_id = %pending.id, executor_id = %executor_id, %reason, "dispatch rejected");
                execution::complete(&self.pool, pending.id, ExecutionStatus::Failed, None, None, Some(&reason)).await?;
                self.maybe_schedule_retry(pending).await
            }
            DispatchOutcome::TimedOut => {
                warn!(execution_id = %pending.id, executor_id = %executor_id, "dispatch timed out");
                execution::timeout(&self.pool, pending.id).await?;
                self.maybe_schedule_retry(pending).await
            }
            DispatchOutcome::Unreachable(reason) => {
                warn!(execution_id = %pending.id, executor_id = %executor_id, %reason, "replacement executor also unreachable, falling through to normal retry");
                execution::complete(&self.pool, pending.id, ExecutionStatus::Failed, None, None, Some(&reason)).await?;
                self.maybe_schedule_retry(pending).await
            }
        }
    }

    /// Scan for executions overdue their deadline and time them out
    /// (spec.md §4.9 step 5, the watchdog).
    pub async fn run_watchdog_pass(&self) -> Result<u64> {
        let overdue = db::list_overdue_running(&self.pool, Utc::now()).await.map_err(SchedulerError::Db)?;
        let count = overdue.len() as u64;

        for execution in &overdue {
            execution::timeout(&self.pool, execution.id).await?;
            self.maybe_schedule_retry(execution).await?;
        }

        Ok(count)
    }

    /// If the execution has retries remaining, perform the transition to
    /// `pending` and re-enter the Dispatcher after the backoff elapses
    /// (spec.md §4.10). The backoff is an in-memory timer on this leader;
    /// a leader change hands the retry to the Reconciler instead.
    async fn maybe_schedule_retry(&self, execution: &TaskExecution) -> Result<()> {
        self.schedule_retry(execution.id, execution.retry_count, execution.max_retries)
    }

    /// Same as [`Self::maybe_schedule_retry`] but keyed by id, for callers
    /// (the Callback Handler) that only have the execution id on hand.
    pub fn schedule_retry_for(&self, execution_id: Uuid, retry_count: i32, max_retries: i32) -> Result<()> {
        self.schedule_retry(execution_id, retry_count, max_retries)
    }

    fn schedule_retry(&self, execution_id: Uuid, retry_count: i32, max_retries: i32) -> Result<()> {
        if retry_count >= max_retries {
            return Ok(());
        }

        let delay = retry_backoff(retry_count, self.retry_base, self.retry_cap);
        let pool = self.pool.clone();
        let client = self.client.clone();
        let scheduler_base = self.scheduler_base.clone();
        let retry_base = self.retry_base;
        let retry_cap = self.retry_cap;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = execution::retry(&pool, execution_id, retry_count, max_retries).await {
                warn!(execution_id = %execution_id, error = %e, "retry transition failed");
                return;
            }

            let execution = match db::get_execution(&pool, execution_id).await {
                Ok(Some(execution)) => execution,
                _ => {
                    warn!(execution_id = %execution_id, "retried execution vanished before re-dispatch");
                    return;
                }
            };
            let task = match tasks_db::get_task(&pool, execution.task_id).await {
                Ok(Some(task)) => task,
                _ => {
                    warn!(execution_id = %execution_id, "could not reload task for retry re-dispatch");
                    return;
                }
            };

            let dispatcher = Dispatcher::new(pool, client, scheduler_base, retry_base, retry_cap);
            if let Err(e) = dispatcher.dispatch(&task, &execution).await {
                warn!(execution_id = %execution_id, error = %e, "re-dispatch after retry failed");
            }
        });

        Ok(())
    }
}

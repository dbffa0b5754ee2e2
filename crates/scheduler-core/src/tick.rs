//! Cron Tick Loop (spec.md §4.8): the leader-only driver that turns due
//! cron firings into dispatched executions. Fans work out to a bounded
//! worker pool the same way the teacher's orchestrator fans agents out to a
//! semaphore-bounded pool, with the same cancellation-drain shape.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use scheduler_db::models::Task;
use scheduler_db::queries::tasks as tasks_db;

use crate::cron::CronPlanner;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SchedulerError};
use crate::execution;
use crate::gate::{self, GateDecision};

/// One tick's outcome for a single task, reported back over the channel.
struct TickDone {
    task_id: Uuid,
    task_name: String,
    result: anyhow::Result<()>,
}

pub struct TickLoop {
    pool: PgPool,
    dispatcher: Arc<Dispatcher>,
    tick_interval: Duration,
    max_concurrent_dispatches: usize,
}

impl TickLoop {
    pub fn new(pool: PgPool, dispatcher: Arc<Dispatcher>, tick_interval: Duration, max_concurrent_dispatches: usize) -> Self {
        Self { pool, dispatcher, tick_interval, max_concurrent_dispatches }
    }

    /// Run one tick: fan out firing evaluation for every active task, bounded
    /// by `max_concurrent_dispatches`, aborting early if `cancel` fires
    /// (spec.md §4.8 step 5: "re-check leadership after each firing").
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        let now = Utc::now();
        let tasks = tasks_db::list_active_tasks(&self.pool).await.map_err(SchedulerError::Db)?;

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_dispatches.max(1)));
        let (tx, mut rx) = mpsc::channel::<TickDone>(tasks.len().max(1));
        let mut in_flight = 0usize;

        for task in tasks {
            if cancel.is_cancelled() {
                info!("leadership lost mid-tick, aborting remaining firings");
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let pool = self.pool.clone();
            let dispatcher = self.dispatcher.clone();
            let tx = tx.clone();
            let task_name = task.name.clone();
            let task_id = task.id;
            let tick_interval = self.tick_interval;

            in_flight += 1;
            tokio::spawn(async move {
                let result = process_task(&pool, &dispatcher, &task, now, tick_interval).await;
                drop(permit);
                let _ = tx.send(TickDone { task_id, task_name, result }).await;
            });

            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                report(&done);
            }
        }
        drop(tx);

        if cancel.is_cancelled() {
            let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while in_flight > 0 {
                match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                    Ok(Some(done)) => {
                        in_flight -= 1;
                        report(&done);
                    }
                    _ => break,
                }
            }
            if in_flight > 0 {
                warn!(remaining = in_flight, "tick drain timed out with firings still in flight");
            }
            return Ok(());
        }

        while let Some(done) = rx.recv().await {
            in_flight = in_flight.saturating_sub(1);
            report(&done);
        }
        debug_assert_eq!(in_flight, 0);

        Ok(())
    }
}

fn report(done: &TickDone) {
    if let Err(e) = &done.result {
        warn!(task_id = %done.task_id, task_name = %done.task_name, error = %e, "tick firing failed");
    }
}

/// Evaluate and dispatch every due firing for one task (spec.md §4.8 steps
/// 3-4). Firings for the same task are processed serially within this call,
/// satisfying the "only one new execution per task per tick" ordering
/// guarantee without needing a lock beyond the Concurrency Gate itself.
async fn process_task(pool: &PgPool, dispatcher: &Dispatcher, task: &Task, now: DateTime<Utc>, tick_interval: Duration) -> anyhow::Result<()> {
    let planner = CronPlanner::parse(&task.cron_expression)?;
    let since = task.last_checked_at.unwrap_or_else(|| now - chrono::Duration::from_std(tick_interval).unwrap_or(chrono::Duration::zero()));

    let mut firings = Vec::new();
    let mut cursor = since;
    while let Some(next) = planner.next_after(cursor) {
        if next > now {
            break;
        }
        firings.push(next);
        cursor = next;
    }

    for scheduled_time in firings {
        match gate::evaluate(pool, task.id, task.execution_mode, scheduled_time).await? {
            GateDecision::Proceed => {
                let pending = execution::create(pool, task.id, scheduled_time, task.max_retry).await?;
                dispatcher.dispatch(task, &pending).await?;
            }
            GateDecision::Skip { reason } => {
                execution::create_skipped(pool, task.id, scheduled_time, task.max_retry, reason).await?;
            }
            GateDecision::DropTick => {
                // Sequential mode: an execution of this task is already non-terminal.
                // Re-evaluate on the next tick rather than piling up a backlog.
            }
        }
    }

    tasks_db::set_last_checked_at(pool, task.id, now).await?;
    Ok(())
}

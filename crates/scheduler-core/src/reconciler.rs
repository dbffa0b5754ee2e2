//! Reconciler (spec.md §4.13): runs once on every follower→leader
//! transition, before the Tick Loop is enabled.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::info;

use scheduler_db::queries::{executions as executions_db, tasks as tasks_db};

use crate::client::ExecutorClient;
use crate::dispatch::Dispatcher;
use crate::error::{Result, SchedulerError};
use crate::execution;

pub struct ReconcilerReport {
    pub orphans_cancelled: usize,
    pub stale_pending_redispatched: usize,
    pub stale_instances_purged: u64,
}

pub struct Reconciler {
    pool: PgPool,
    client: Arc<dyn ExecutorClient>,
    scheduler_base: String,
    reconciler_grace: Duration,
    purge_age: Duration,
    retry_base: Duration,
    retry_cap: Duration,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        client: Arc<dyn ExecutorClient>,
        scheduler_base: String,
        reconciler_grace: Duration,
        purge_age: Duration,
        retry_base: Duration,
        retry_cap: Duration,
    ) -> Self {
        Self { pool, client, scheduler_base, reconciler_grace, purge_age, retry_base, retry_cap }
    }

    /// Run the four reconciliation steps in order (spec.md §4.13).
    pub async fn run(&self) -> Result<ReconcilerReport> {
        let orphans_cancelled = self.cancel_orphaned_running().await?;
        let stale_pending_redispatched = self.redispatch_stale_pending().await?;
        let stale_instances_purged = self.purge_stale_instances().await?;
        self.reset_last_checked_at().await?;

        info!(
            orphans_cancelled,
            stale_pending_redispatched, stale_instances_purged, "reconciler pass complete"
        );

        Ok(ReconcilerReport { orphans_cancelled, stale_pending_redispatched, stale_instances_purged })
    }

    /// Step 1: cancel `running` executions whose executor is absent,
    /// offline, or unhealthy.
    async fn cancel_orphaned_running(&self) -> Result<usize> {
        let orphans = executions_db::list_running_with_unavailable_executor(&self.pool).await.map_err(SchedulerError::Db)?;

        for orphan in &orphans {
            execution::cancel(&self.pool, orphan.id, "executor no longer available").await?;
        }

        Ok(orphans.len())
    }

    /// Step 2: re-enter the Dispatcher for `pending` executions older than
    /// the grace window.
    async fn redispatch_stale_pending(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.reconciler_grace).unwrap_or(chrono::Duration::zero());
        let stale = executions_db::list_stale_pending(&self.pool, cutoff).await.map_err(SchedulerError::Db)?;

        let dispatcher = Dispatcher::new(self.pool.clone(), self.client.clone(), self.scheduler_base.clone(), self.retry_base, self.retry_cap);

        for pending in &stale {
            let task = tasks_db::get_task(&self.pool, pending.task_id).await.map_err(SchedulerError::Db)?;
            if let Some(task) = task {
                dispatcher.dispatch(&task, pending).await?;
            }
        }

        Ok(stale.len())
    }

    /// Step 3: purge scheduler-instance rows with a stale heartbeat.
    async fn purge_stale_instances(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.purge_age).unwrap_or(chrono::Duration::zero());
        scheduler_db::queries::instances::purge_stale(&self.pool, cutoff).await.map_err(SchedulerError::Db)
    }

    /// Step 4: set every active task's `last_checked_at` to `now` so the
    /// Tick Loop does not replay ticks missed while leaderless.
    async fn reset_last_checked_at(&self) -> Result<u64> {
        tasks_db::reset_last_checked_at_for_active_tasks(&self.pool).await.map_err(SchedulerError::Db)
    }
}

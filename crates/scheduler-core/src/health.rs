//! Health Monitor (spec.md §4.12): runs on every instance regardless of
//! leadership, probing this instance's shard of the executor keyspace.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use scheduler_db::models::Executor;
use scheduler_db::queries::executors as db;

use crate::client::ExecutorClient;
use crate::error::{Result, SchedulerError};

pub struct HealthMonitor {
    pool: PgPool,
    client: Arc<dyn ExecutorClient>,
    failure_threshold: i32,
    check_deadline: Duration,
}

impl HealthMonitor {
    pub fn new(pool: PgPool, client: Arc<dyn ExecutorClient>, failure_threshold: i32, check_deadline: Duration) -> Self {
        Self { pool, client, failure_threshold, check_deadline }
    }

    /// Probe this instance's shard of stale executors and record the
    /// outcome of each check (spec.md §4.12). Returns the number probed.
    pub async fn run_pass(&self, interval: Duration, instance_index: usize, active_instance_count: usize) -> Result<usize> {
        let stale_before = Utc::now() - chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
        let candidates = db::list_executors_needing_health_check(&self.pool, stale_before).await.map_err(SchedulerError::Db)?;

        let mine: Vec<Executor> = candidates
            .into_iter()
            .filter(|e| shard_of(e.id, active_instance_count) == instance_index)
            .collect();

        for executor in &mine {
            let healthy = self.client.health_check(&executor.health_check_url, self.check_deadline).await;
            let updated = db::record_health_check(&self.pool, executor.id, healthy, self.failure_threshold, Utc::now())
                .await
                .map_err(SchedulerError::Db)?;

            if !updated.is_healthy {
                warn!(executor_id = %executor.id, failures = updated.consecutive_health_failures, "executor marked unhealthy");
            }
        }

        Ok(mine.len())
    }
}

/// Which instance shard owns `executor_id`'s health checks (spec.md §4.12:
/// `hash(executor_id) mod active_instance_count`).
pub fn shard_of(executor_id: Uuid, active_instance_count: usize) -> usize {
    if active_instance_count == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    executor_id.hash(&mut hasher);
    (hasher.finish() % active_instance_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_of_is_stable_for_the_same_id_and_count() {
        let id = Uuid::new_v4();
        assert_eq!(shard_of(id, 5), shard_of(id, 5));
    }

    #[test]
    fn shard_of_is_within_bounds() {
        let id = Uuid::new_v4();
        for count in 1..10 {
            assert!(shard_of(id, count) < count);
        }
    }

    #[test]
    fn shard_of_distributes_across_many_ids() {
        let count = 4;
        let mut seen = [false; 4];
        for _ in 0..200 {
            let shard = shard_of(Uuid::new_v4(), count);
            seen[shard] = true;
        }
        assert!(seen.iter().all(|&s| s), "expected every shard to be hit across 200 random ids");
    }
}

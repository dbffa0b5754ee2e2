//! Instance Registry (spec.md §4.2): thin wrapper over
//! `scheduler_db::queries::instances` adding the config-driven stale
//! threshold.

use anyhow::Result;
use sqlx::PgPool;

use scheduler_db::models::SchedulerInstance;
use scheduler_db::queries::instances as db;

use crate::config::SchedulerConfig;

pub struct InstanceRegistry<'a> {
    pool: PgPool,
    config: &'a SchedulerConfig,
}

impl<'a> InstanceRegistry<'a> {
    pub fn new(pool: PgPool, config: &'a SchedulerConfig) -> Self {
        Self { pool, config }
    }

    pub async fn register(&self) -> Result<SchedulerInstance> {
        db::upsert(&self.pool, &self.config.instance_id, &self.config.host, self.config.port as i32).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        db::heartbeat(&self.pool, &self.config.instance_id).await?;
        Ok(())
    }

    pub async fn mark_leader(&self, elected_at: chrono::DateTime<chrono::Utc>) -> Result<()> {
        db::set_leader(&self.pool, &self.config.instance_id, elected_at).await
    }

    pub async fn clear_leader(&self) -> Result<()> {
        db::clear_leader(&self.pool, &self.config.instance_id).await
    }

    /// Instances with a heartbeat within the stale threshold (spec.md §4.2).
    pub async fn list_healthy(&self) -> Result<Vec<SchedulerInstance>> {
        let stale_threshold = chrono::Duration::from_std(self.config.stale_threshold()).unwrap_or(chrono::Duration::zero());
        db::list_healthy(&self.pool, chrono::Utc::now(), stale_threshold).await
    }

    /// Purge instances whose heartbeat predates `config.purge_age` (spec.md
    /// §4.13 step 3).
    pub async fn purge_stale(&self) -> Result<u64> {
        let purge_age = chrono::Duration::from_std(self.config.purge_age).unwrap_or(chrono::Duration::zero());
        let cutoff = chrono::Utc::now() - purge_age;
        db::purge_stale(&self.pool, cutoff).await
    }
}

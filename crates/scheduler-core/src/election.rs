//! Leader Elector (spec.md §4.3): state machine {follower, candidate,
//! leader} driving acquire/refresh/step-down against the Lock Service and
//! Instance Registry.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::lock::LockService;
use crate::registry::InstanceRegistry;

/// The role an instance currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// Drives leadership for one instance.
///
/// `cancel_on_step_down` is the token threaded through the Tick Loop and
/// its worker pool (spec.md §5): it is cancelled every time this instance
/// loses leadership so in-flight dispatches are aborted promptly, and a
/// fresh token is handed out on the next successful acquisition.
pub struct LeaderElector<'a> {
    lock: Arc<dyn LockService>,
    config: &'a SchedulerConfig,
    role: Role,
}

impl<'a> LeaderElector<'a> {
    pub fn new(lock: Arc<dyn LockService>, config: &'a SchedulerConfig) -> Self {
        Self { lock, config, role: Role::Follower }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// One election-poll iteration while a follower: attempt to acquire the
    /// lock. On success, transitions to leader and returns a fresh
    /// cancellation token scoped to this leadership term.
    pub async fn try_become_leader(&mut self, registry: &InstanceRegistry<'_>) -> anyhow::Result<Option<CancellationToken>> {
        debug_assert_eq!(self.role, Role::Follower);

        let acquired = self
            .lock
            .try_acquire(&self.config.cluster_lock_key, &self.config.instance_id, self.config.leader_ttl)
            .await
            .unwrap_or(false);

        if !acquired {
            return Ok(None);
        }

        self.role = Role::Leader;
        registry.mark_leader(Utc::now()).await?;
        info!(instance_id = %self.config.instance_id, "acquired leader lock");
        Ok(Some(CancellationToken::new()))
    }

    /// One refresh iteration while leader. Returns `false` (and steps down)
    /// if the refresh failed -- ownership was lost.
    pub async fn refresh_or_step_down(&mut self, registry: &InstanceRegistry<'_>, term: &CancellationToken) -> anyhow::Result<bool> {
        debug_assert_eq!(self.role, Role::Leader);

        let refreshed = self
            .lock
            .refresh(&self.config.cluster_lock_key, &self.config.instance_id, self.config.leader_ttl)
            .await
            .unwrap_or(false);

        if !refreshed {
            warn!(instance_id = %self.config.instance_id, "lost leader lock on refresh, stepping down");
            self.role = Role::Follower;
            registry.clear_leader().await?;
            term.cancel();
            return Ok(false);
        }

        Ok(true)
    }

    /// Voluntary step-down on shutdown or maintenance mode.
    pub async fn step_down(&mut self, registry: &InstanceRegistry<'_>, term: &CancellationToken) -> anyhow::Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        self.lock.release(&self.config.cluster_lock_key, &self.config.instance_id).await?;
        registry.clear_leader().await?;
        term.cancel();
        self.role = Role::Follower;
        info!(instance_id = %self.config.instance_id, "released leader lock");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct FakeLock {
        acquire_result: AtomicBool,
        refresh_result: AtomicBool,
    }

    #[async_trait]
    impl LockService for FakeLock {
        async fn try_acquire(&self, _key: &str, _owner: &str, _ttl: Duration) -> anyhow::Result<bool> {
            Ok(self.acquire_result.load(Ordering::SeqCst))
        }
        async fn refresh(&self, _key: &str, _owner: &str, _ttl: Duration) -> anyhow::Result<bool> {
            Ok(self.refresh_result.load(Ordering::SeqCst))
        }
        async fn release(&self, _key: &str, _owner: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn is_owner(&self, _key: &str, _owner: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig { instance_id: "test".into(), ..Default::default() }
    }

    #[test]
    fn starts_as_follower() {
        let lock = Arc::new(FakeLock { acquire_result: AtomicBool::new(true), refresh_result: AtomicBool::new(true) });
        let cfg = config();
        let elector = LeaderElector::new(lock, &cfg);
        assert_eq!(elector.role(), Role::Follower);
    }
}

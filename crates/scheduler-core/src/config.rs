//! Engine configuration.
//!
//! A single explicit struct passed to every component constructor -- no
//! module-level mutable state (spec.md §9).

use std::time::Duration;

/// Tuning knobs for one scheduler instance (spec.md §6 "Config").
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// This instance's unique identifier, used as the lock owner id and the
    /// `scheduler_instances.instance_id` key.
    pub instance_id: String,
    pub host: String,
    pub port: u16,

    /// Well-known leader lock key (spec.md §3 "Leader Lock").
    pub cluster_lock_key: String,
    /// How often the Instance Registry's heartbeat is refreshed.
    pub heartbeat_interval: Duration,
    /// Leader lock TTL.
    pub leader_ttl: Duration,
    /// How often a follower attempts `try_acquire`.
    pub election_poll_interval: Duration,
    /// How often the Tick Loop wakes up.
    pub tick_interval: Duration,
    /// How often the Health Monitor probes a given executor.
    pub health_check_interval: Duration,
    /// Grace window before the Reconciler re-dispatches stale pending executions.
    pub reconciler_grace: Duration,
    /// Instance rows with a heartbeat older than this are purged.
    pub purge_age: Duration,
    /// Maximum concurrent in-flight dispatches per leader (spec.md §5).
    pub max_concurrent_dispatches: usize,
    /// Health-check failure threshold before an executor is marked offline.
    pub health_failure_threshold: i32,

    pub dispatch_deadline: Duration,
    pub callback_deadline: Duration,
    pub health_check_deadline: Duration,
    pub lock_call_deadline: Duration,
    pub db_call_deadline: Duration,

    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl SchedulerConfig {
    /// Leader refresh happens at half the TTL (spec.md §4.3 defaults).
    pub fn leader_refresh_interval(&self) -> Duration {
        self.leader_ttl / 2
    }

    /// Instances whose heartbeat is older than this are considered stale
    /// (spec.md §4.2, default 3x heartbeat_interval).
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: "scheduler-instance".to_owned(),
            host: "0.0.0.0".to_owned(),
            port: 8080,
            cluster_lock_key: "scheduler_leader_lock".to_owned(),
            heartbeat_interval: Duration::from_secs(30),
            leader_ttl: Duration::from_secs(30),
            election_poll_interval: Duration::from_secs(10),
            tick_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
            reconciler_grace: Duration::from_secs(60),
            purge_age: Duration::from_secs(24 * 3600),
            max_concurrent_dispatches: 32,
            health_failure_threshold: 3,
            dispatch_deadline: Duration::from_secs(300),
            callback_deadline: Duration::from_secs(30),
            health_check_deadline: Duration::from_secs(5),
            lock_call_deadline: Duration::from_secs(5),
            db_call_deadline: Duration::from_secs(10),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
        }
    }
}

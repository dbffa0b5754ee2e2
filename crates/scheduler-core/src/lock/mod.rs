//! Distributed lock abstraction (spec.md §4.1).
//!
//! Decouples the Leader Elector from the backend so that different
//! implementations (a relational table, a Redis-like KV store) can be used
//! interchangeably -- the one plausible point of backend substitution in
//! this engine, unlike the single-backend aggregates in `scheduler_db`.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use postgres::PostgresLock;

/// TTL-bounded distributed mutex on a named key.
///
/// Mutual exclusion is guaranteed across the cluster through a single
/// source of truth; liveness is bounded by `ttl` even if an owner crashes
/// without releasing. Transient backend errors are surfaced as `Err`; the
/// Leader Elector treats any error the same as "not owner" (the safe side).
#[async_trait]
pub trait LockService: Send + Sync {
    /// Atomically create `key` bound to `owner_id` with `expires_at = now +
    /// ttl`. Returns `true` iff the key did not previously exist, or had
    /// expired and was reclaimed.
    async fn try_acquire(&self, key: &str, owner_id: &str, ttl: std::time::Duration) -> anyhow::Result<bool>;

    /// Iff `key` exists and is owned by `owner_id`, reset its expiry.
    /// Returns `false` if ownership was lost; this is detectable without
    /// races because the underlying compare happens inside a single atomic
    /// statement.
    async fn refresh(&self, key: &str, owner_id: &str, ttl: std::time::Duration) -> anyhow::Result<bool>;

    /// Delete `key` iff owned by `owner_id`.
    async fn release(&self, key: &str, owner_id: &str) -> anyhow::Result<()>;

    /// Check current ownership, accounting for expiry.
    async fn is_owner(&self, key: &str, owner_id: &str) -> anyhow::Result<bool>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn LockService) {}
};

pub(crate) fn expires_at(ttl: std::time::Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}

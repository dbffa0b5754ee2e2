//! Relational implementation of [`super::LockService`] backed by the
//! `distributed_locks` table.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use scheduler_db::queries::lock as db;

use super::{expires_at, LockService};

pub struct PostgresLock {
    pool: PgPool,
}

impl PostgresLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockService for PostgresLock {
    async fn try_acquire(&self, key: &str, owner_id: &str, ttl: std::time::Duration) -> anyhow::Result<bool> {
        db::try_acquire(&self.pool, key, owner_id, expires_at(ttl), Utc::now()).await
    }

    async fn refresh(&self, key: &str, owner_id: &str, ttl: std::time::Duration) -> anyhow::Result<bool> {
        db::refresh(&self.pool, key, owner_id, expires_at(ttl)).await
    }

    async fn release(&self, key: &str, owner_id: &str) -> anyhow::Result<()> {
        db::release(&self.pool, key, owner_id).await
    }

    async fn is_owner(&self, key: &str, owner_id: &str) -> anyhow::Result<bool> {
        db::is_owner(&self.pool, key, owner_id, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_service_is_object_safe() {
        fn _assert(_: &dyn LockService) {}
    }
}

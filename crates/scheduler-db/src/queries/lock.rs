//! Database query functions for the `distributed_locks` table -- the
//! relational implementation of the Lock Service contract (spec.md §4.1).
//!
//! Every statement is a single atomic `UPDATE`/`INSERT ... ON CONFLICT`, so
//! ownership checks and mutations never race: the database's row-level
//! locking is the compare-and-set primitive spec.md §4.1 asks for.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Attempt to acquire `key` for `owner_id` until `expires_at`.
///
/// Succeeds (returns `true`) if the row does not exist, or exists but has
/// already expired (reclaimed). Returns `false` if another owner currently
/// holds an unexpired lock.
pub async fn try_acquire(
    pool: &PgPool,
    key: &str,
    owner_id: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO distributed_locks (lock_key, owner_id, expires_at) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (lock_key) DO UPDATE \
             SET owner_id = EXCLUDED.owner_id, expires_at = EXCLUDED.expires_at \
             WHERE distributed_locks.expires_at < $4",
    )
    .bind(key)
    .bind(owner_id)
    .bind(expires_at)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to attempt lock acquisition")?;

    Ok(result.rows_affected() == 1)
}

/// Refresh `key`'s expiry iff it is currently owned by `owner_id`.
/// Returns `false` if ownership was lost (the row is absent or owned by
/// someone else) -- the caller must treat that as "not owner".
pub async fn refresh(
    pool: &PgPool,
    key: &str,
    owner_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE distributed_locks SET expires_at = $3 WHERE lock_key = $1 AND owner_id = $2",
    )
    .bind(key)
    .bind(owner_id)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("failed to refresh lock")?;

    Ok(result.rows_affected() == 1)
}

/// Delete `key` iff owned by `owner_id`.
pub async fn release(pool: &PgPool, key: &str, owner_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM distributed_locks WHERE lock_key = $1 AND owner_id = $2")
        .bind(key)
        .bind(owner_id)
        .execute(pool)
        .await
        .context("failed to release lock")?;

    Ok(())
}

/// Check current ownership of `key`, accounting for expiry: an expired
/// lock has no owner regardless of the stored `owner_id`.
pub async fn is_owner(pool: &PgPool, key: &str, owner_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let row: Option<(bool,)> = sqlx::query_as(
        "SELECT (owner_id = $2 AND expires_at >= $3) FROM distributed_locks WHERE lock_key = $1",
    )
    .bind(key)
    .bind(owner_id)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to check lock ownership")?;

    Ok(row.map(|(owned,)| owned).unwrap_or(false))
}

//! Database query functions for the `domain_events` outbox table (spec.md
//! §9 "domain events as tagged values").

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgExecutor, PgPool};

use crate::models::DomainEventRow;

/// Append a domain event row. Generic over [`PgExecutor`] so callers run
/// this in the same transaction as the state mutation it describes
/// (spec.md §4.5 "Event emission is synchronous with the state mutation and
/// flushed in the same transaction as the persistence write"): pass
/// `&mut *tx` rather than a bare pool.
pub async fn record<'c, E: PgExecutor<'c>>(
    executor: E,
    aggregate_type: &str,
    aggregate_id: &str,
    event_type: &str,
    payload: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO domain_events (aggregate_type, aggregate_id, event_type, payload) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(aggregate_type)
    .bind(aggregate_id)
    .bind(event_type)
    .bind(payload)
    .execute(executor)
    .await
    .context("failed to record domain event")?;

    Ok(())
}

/// List events for a single aggregate instance, oldest first.
pub async fn list_for_aggregate(
    pool: &PgPool,
    aggregate_type: &str,
    aggregate_id: &str,
) -> Result<Vec<DomainEventRow>> {
    let events = sqlx::query_as::<_, DomainEventRow>(
        "SELECT * FROM domain_events \
         WHERE aggregate_type = $1 AND aggregate_id = $2 \
         ORDER BY occurred_at ASC",
    )
    .bind(aggregate_type)
    .bind(aggregate_id)
    .fetch_all(pool)
    .await
    .context("failed to list events for aggregate")?;

    Ok(events)
}

//! Domain events: the source's "domain event bag" collapsed into a single
//! tagged sum type (spec.md §9), published synchronously inside the
//! persistence transaction that produced it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

use scheduler_db::queries::events as db;

/// One domain event. The variant name (via `event_type()`) and the
/// `payload()` are what gets written to the `domain_events` outbox row.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Created { execution_id: Uuid, task_id: Uuid, scheduled_time: DateTime<Utc> },
    Started { execution_id: Uuid, executor_id: Uuid, start_time: DateTime<Utc> },
    Reassigned { execution_id: Uuid, from_executor_id: Uuid, to_executor_id: Uuid },
    Completed { execution_id: Uuid, status: String, end_time: DateTime<Utc> },
    Failed { execution_id: Uuid, error: String },
    Cancelled { execution_id: Uuid, reason: String },
    Skipped { execution_id: Uuid, reason: String },
    Retried { execution_id: Uuid, retry_count: i32 },
    StatusChanged { execution_id: Uuid, from: String, to: String },
    LeaderElected { instance_id: String, elected_at: DateTime<Utc> },
    LeadershipLost { instance_id: String },
    ExecutorRegistered { executor_id: Uuid, name: String },
    HealthDegraded { executor_id: Uuid, consecutive_failures: i32 },
    HealthRecovered { executor_id: Uuid },
}

impl DomainEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Started { .. } => "started",
            Self::Reassigned { .. } => "reassigned",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Skipped { .. } => "skipped",
            Self::Retried { .. } => "retried",
            Self::StatusChanged { .. } => "status_changed",
            Self::LeaderElected { .. } => "leader_elected",
            Self::LeadershipLost { .. } => "leadership_lost",
            Self::ExecutorRegistered { .. } => "executor_registered",
            Self::HealthDegraded { .. } => "health_degraded",
            Self::HealthRecovered { .. } => "health_recovered",
        }
    }

    fn aggregate(&self) -> (&'static str, String) {
        match self {
            Self::Created { execution_id, .. }
            | Self::Started { execution_id, .. }
            | Self::Reassigned { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Failed { execution_id, .. }
            | Self::Cancelled { execution_id, .. }
            | Self::Skipped { execution_id, .. }
            | Self::Retried { execution_id, .. }
            | Self::StatusChanged { execution_id, .. } => ("execution", execution_id.to_string()),
            Self::LeaderElected { instance_id, .. } | Self::LeadershipLost { instance_id } => {
                ("scheduler_instance", instance_id.clone())
            }
            Self::ExecutorRegistered { executor_id, .. }
            | Self::HealthDegraded { executor_id, .. }
            | Self::HealthRecovered { executor_id } => ("executor", executor_id.to_string()),
        }
    }

    fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Append this event in the caller's transaction. Callers always pass
    /// `&mut *tx` here, in the same transaction as the state mutation the
    /// event describes (spec.md §4.5).
    pub async fn record<'c, E: PgExecutor<'c>>(&self, executor: E) -> anyhow::Result<()> {
        let (aggregate_type, aggregate_id) = self.aggregate();
        db::record(executor, aggregate_type, &aggregate_id, self.event_type(), &self.payload()).await
    }
}

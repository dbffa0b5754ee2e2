//! Row types for the scheduler's persisted aggregates.
//!
//! Every status enum is stored as `text` in Postgres (see `migrations/`) and
//! round-trips through `sqlx::Type` the same way on the wire via `serde`, so
//! the admin HTTP layer and the database agree on one representation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Deleted,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "deleted" => Ok(Self::Deleted),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

/// Execution-concurrency policy for a task (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
    Skip,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Skip => "skip",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            "skip" => Ok(Self::Skip),
            other => Err(ParseEnumError::new("execution mode", other)),
        }
    }
}

/// Load-balancing strategy for selecting among a task's healthy executors
/// (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    Random,
    Sticky,
    LeastLoaded,
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::Random => "random",
            Self::Sticky => "sticky",
            Self::LeastLoaded => "least_loaded",
        };
        f.write_str(s)
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "random" => Ok(Self::Random),
            "sticky" => Ok(Self::Sticky),
            "least_loaded" => Ok(Self::LeastLoaded),
            other => Err(ParseEnumError::new("load balance strategy", other)),
        }
    }
}

/// Status of an [`Executor`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Online,
    Offline,
    Maintenance,
}

impl fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutorStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(ParseEnumError::new("executor status", other)),
        }
    }
}

/// Lifecycle status of a [`TaskExecution`] (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Skipped,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses per spec.md §3/§4.5: `{success, failed, timeout,
    /// skipped, cancelled}`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Skipped | Self::Cancelled
        )
    }

    /// Non-terminal statuses that count against concurrency-gate limits:
    /// `{pending, running}`.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("execution status", other)),
        }
    }
}

/// Error returned when parsing an invalid enum string from the database.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// A schedulable task definition (spec.md §3 "Task").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub parameters: Value,
    pub execution_mode: ExecutionMode,
    pub load_balance_strategy: LoadBalanceStrategy,
    pub max_retry: i32,
    pub timeout_seconds: i32,
    pub status: TaskStatus,
    /// Leader-local cursor persisted so a new leader can resume ticking
    /// without replaying ticks missed while leaderless (spec.md §4.8, §4.13).
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A (task, executor) eligibility edge (spec.md §3 "Task↔Executor Assignment").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskAssignment {
    pub id: Uuid,
    pub task_id: Uuid,
    pub executor_name: String,
    pub priority: i32,
    pub weight: i32,
    pub created_at: DateTime<Utc>,
}

/// A remote HTTP worker (spec.md §3 "Executor").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Executor {
    pub id: Uuid,
    pub instance_id: String,
    pub name: String,
    pub base_url: String,
    pub health_check_url: String,
    pub status: ExecutorStatus,
    pub is_healthy: bool,
    pub consecutive_health_failures: i32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt to run a task (spec.md §3 "Task Execution").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub executor_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub scheduled_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub result: Option<Value>,
    pub logs: Option<String>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-task cursor/history for stateful load-balancing strategies
/// (spec.md §3 "Load-Balance State").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LoadBalanceState {
    pub task_id: Uuid,
    pub round_robin_index: i64,
    pub last_executor_id: Option<Uuid>,
    pub sticky_executor_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// A participant in the scheduler cluster (spec.md §3 "Scheduler Instance").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SchedulerInstance {
    pub instance_id: String,
    pub host: String,
    pub port: i32,
    pub is_leader: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub leader_elected_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

/// A row in the `domain_events` outbox table (spec.md §9 "domain events as
/// tagged values"), written in the same transaction as the mutation that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DomainEventRow {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_terminal_set_matches_spec() {
        for s in [
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Skipped,
            ExecutionStatus::Cancelled,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
        for s in [ExecutionStatus::Pending, ExecutionStatus::Running] {
            assert!(!s.is_terminal(), "{s} should not be terminal");
        }
    }

    #[test]
    fn execution_status_round_trips_through_display_and_from_str() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Skipped,
            ExecutionStatus::Cancelled,
        ] {
            let printed = s.to_string();
            let parsed: ExecutionStatus = printed.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn load_balance_strategy_rejects_unknown_value() {
        let err = "bogus".parse::<LoadBalanceStrategy>().unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}

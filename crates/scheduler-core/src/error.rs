//! The engine-boundary error taxonomy (spec.md §7).

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the scheduling engine.
///
/// Business-layer functions return this; the coordination layer (tick loop,
/// dispatcher, health monitor) logs and decides retry/cancel/continue;
/// `scheduler-cli`'s admin HTTP handlers map these to status codes.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad request -- surface to caller, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing task/executor/execution -- surface, never retried.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// State-machine violation (e.g. `start()` on a non-pending execution) --
    /// surface; indicates programmer error or a racing retry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// DB timeout, lock backend unavailable, executor HTTP 5xx -- retried
    /// with backoff, bounded.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The selected executor went offline mid-dispatch. Does not count
    /// against the task's retry budget; one immediate re-selection is
    /// permitted, then normal retry applies.
    #[error("executor {executor_id} is down")]
    ExecutorDown { executor_id: Uuid },

    /// Empty healthy candidate set -- the execution stays `pending`, retried
    /// on the next tick.
    #[error("no healthy executor available for task {task_id}")]
    NoExecutor { task_id: Uuid },

    /// Configuration missing at startup -- the process exits.
    #[error("fatal configuration error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

impl SchedulerError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }

    /// Whether the dispatcher/callback handler should attempt a retry for
    /// this error (spec.md §7 propagation rules).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ExecutorDown { .. } | Self::NoExecutor { .. })
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

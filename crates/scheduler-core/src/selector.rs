//! Executor Selector (spec.md §4.6): implements the five load-balancing
//! strategies over a task's healthy assigned executors, persisting
//! per-task state for the stateful ones.

use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

use scheduler_db::models::{Executor, LoadBalanceStrategy};
use scheduler_db::queries::{executions, executors, load_balance};

use crate::error::{Result, SchedulerError};

/// A candidate executor with its assignment-level priority and weight.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub executor: Executor,
    pub priority: i32,
    pub weight: i32,
}

/// Select an executor for `task_id` using `strategy` over its candidate set.
///
/// The candidate set `E` is already restricted to online, healthy,
/// assigned executors (spec.md §4.6 "all strategies treat unhealthy/
/// offline/maintenance executors as absent from E") by the caller's query.
pub async fn select(pool: &PgPool, task_id: Uuid, strategy: LoadBalanceStrategy) -> Result<Executor> {
    let rows = executors::list_healthy_assigned_executors(pool, task_id)
        .await
        .map_err(SchedulerError::Db)?;

    if rows.is_empty() {
        return Err(SchedulerError::NoExecutor { task_id });
    }

    // list_healthy_assigned_executors already orders by (priority desc, id asc).
    let candidates: Vec<Candidate> = rows
        .into_iter()
        .map(|(executor, priority, weight)| Candidate { executor, priority, weight })
        .collect();

    let chosen = match strategy {
        LoadBalanceStrategy::RoundRobin => round_robin(pool, task_id, &candidates).await?,
        LoadBalanceStrategy::WeightedRoundRobin => weighted_round_robin(pool, task_id, &candidates).await?,
        LoadBalanceStrategy::Random => random(&candidates),
        LoadBalanceStrategy::Sticky => sticky(pool, task_id, &candidates).await?,
        LoadBalanceStrategy::LeastLoaded => least_loaded(pool, &candidates).await?,
    };

    Ok(chosen)
}

async fn round_robin(pool: &PgPool, task_id: Uuid, candidates: &[Candidate]) -> Result<Executor> {
    let state = load_balance::get_or_create(pool, task_id).await.map_err(SchedulerError::Db)?;
    let index = (state.round_robin_index as usize) % candidates.len();
    let chosen = candidates[index].executor.clone();

    let next_index = (index as i64 + 1) % candidates.len() as i64;
    load_balance::advance_round_robin(pool, task_id, next_index, chosen.id)
        .await
        .map_err(SchedulerError::Db)?;

    Ok(chosen)
}

/// Expand candidates into a virtual sequence where each executor appears
/// `weight` times, then apply round-robin over that sequence. The persisted
/// index is absolute into the virtual sequence so it survives membership
/// churn (taken modulo the new length on each read, per spec.md §4.6).
async fn weighted_round_robin(pool: &PgPool, task_id: Uuid, candidates: &[Candidate]) -> Result<Executor> {
    let mut virtual_sequence = Vec::new();
    for candidate in candidates {
        for _ in 0..candidate.weight.max(1) {
            virtual_sequence.push(candidate.executor.clone());
        }
    }

    let state = load_balance::get_or_create(pool, task_id).await.map_err(SchedulerError::Db)?;
    let index = (state.round_robin_index as usize) % virtual_sequence.len();
    let chosen = virtual_sequence[index].clone();

    let next_index = state.round_robin_index + 1;
    load_balance::advance_round_robin(pool, task_id, next_index, chosen.id)
        .await
        .map_err(SchedulerError::Db)?;

    Ok(chosen)
}

fn random(candidates: &[Candidate]) -> Executor {
    let index = rand::rng().random_range(0..candidates.len());
    candidates[index].executor.clone()
}

async fn sticky(pool: &PgPool, task_id: Uuid, candidates: &[Candidate]) -> Result<Executor> {
    let state = load_balance::get_or_create(pool, task_id).await.map_err(SchedulerError::Db)?;

    if let Some(sticky_id) = state.sticky_executor_id {
        if let Some(candidate) = candidates.iter().find(|c| c.executor.id == sticky_id) {
            return Ok(candidate.executor.clone());
        }
    }

    // Sticky executor absent or never chosen: fall back to round-robin and
    // persist the pick as the new sticky executor.
    let chosen = round_robin(pool, task_id, candidates).await?;
    load_balance::set_sticky(pool, task_id, chosen.id).await.map_err(SchedulerError::Db)?;
    Ok(chosen)
}

async fn least_loaded(pool: &PgPool, candidates: &[Candidate]) -> Result<Executor> {
    let mut best: Option<(Candidate, i64)> = None;

    for candidate in candidates {
        let load = executions::count_running_for_executor(pool, candidate.executor.id)
            .await
            .map_err(SchedulerError::Db)?;

        best = match best {
            None => Some((candidate.clone(), load)),
            Some((_, best_load)) if load < best_load => Some((candidate.clone(), load)),
            Some(keep) => Some(keep),
        };
    }

    // candidates is non-empty (checked by the caller), so best is always set.
    Ok(best.expect("candidates is non-empty").0.executor)
}

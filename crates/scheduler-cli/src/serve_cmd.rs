//! Admin HTTP surface (spec.md §4.14) plus the background loops that make
//! one `serve` process a full cluster participant: heartbeat, leader
//! election, tick loop, health monitor (spec.md §5).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use scheduler_core::callback::{CallbackHandler, CallbackPayload};
use scheduler_core::client::ExecutorClient;
use scheduler_core::config::SchedulerConfig;
use scheduler_core::dispatch::Dispatcher;
use scheduler_core::election::{LeaderElector, Role};
use scheduler_core::error::SchedulerError;
use scheduler_core::health::HealthMonitor;
use scheduler_core::lock::{LockService, PostgresLock};
use scheduler_core::reconciler::Reconciler;
use scheduler_core::registry::InstanceRegistry;
use scheduler_core::tick::TickLoop;
use scheduler_db::models::{Executor, LoadBalanceStrategy, SchedulerInstance, Task, TaskExecution, TaskStatus};
use scheduler_db::queries::{assignments as assignments_db, executions as executions_db, executors as executors_db, tasks as tasks_db};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{err:#}") }
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        let status = match &err {
            SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
            SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::Conflict(_) => StatusCode::CONFLICT,
            SchedulerError::Transient(_) | SchedulerError::ExecutorDown { .. } | SchedulerError::NoExecutor { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SchedulerError::Fatal(_) | SchedulerError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub cron_expression: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub execution_mode: scheduler_db::models::ExecutionMode,
    #[serde(default)]
    pub load_balance_strategy: LoadBalanceStrategy,
    #[serde(default = "default_max_retry")]
    pub max_retry: i32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: i32,
}

fn default_parameters() -> Value {
    serde_json::json!({})
}

fn default_max_retry() -> i32 {
    3
}

fn default_timeout_seconds() -> i32 {
    300
}

#[derive(Debug, Deserialize)]
pub struct RegisterExecutorRequest {
    pub name: String,
    pub base_url: String,
    pub health_check_url: String,
    #[serde(default = "default_parameters")]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct CreateAssignmentRequest {
    pub executor_name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_priority() -> i32 {
    0
}

fn default_weight() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub instances: Vec<SchedulerInstance>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    callback_handler: Arc<CallbackHandler>,
    registry_config: Arc<SchedulerConfig>,
}

pub fn build_router(pool: PgPool, callback_handler: Arc<CallbackHandler>, registry_config: Arc<SchedulerConfig>) -> Router {
    let state = AppState { pool, callback_handler, registry_config };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/cluster", get(get_cluster))
        .route("/api/v1/tasks", post(create_task).get(list_tasks))
        .route("/api/v1/tasks/{id}", get(get_task).patch(update_task))
        .route("/api/v1/tasks/{id}/pause", post(pause_task))
        .route("/api/v1/tasks/{id}/resume", post(resume_task))
        .route("/api/v1/tasks/{id}/assignments", post(create_assignment))
        .route("/api/v1/executors", post(register_executor).get(list_executors))
        .route("/api/v1/executors/{id}", get(get_executor))
        .route("/api/v1/executions", get(list_executions))
        .route("/api/v1/executions/{id}", get(get_execution))
        .route("/api/v1/executions/{id}/callback", post(post_callback))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(pool: PgPool, config: SchedulerConfig, client: Arc<dyn ExecutorClient>) -> Result<()> {
    let scheduler_base = format!("http://{}:{}", config.host, config.port);
    let dispatcher = Dispatcher::new(pool.clone(), client.clone(), scheduler_base.clone(), config.retry_base, config.retry_cap);
    let callback_handler = Arc::new(CallbackHandler::new(dispatcher));

    let config = Arc::new(config);
    let app = build_router(pool.clone(), callback_handler, config.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "schedulerd serve listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Shared between the HTTP server's graceful shutdown and the cluster
    // loops below so Ctrl+C stops both in lockstep: a leader killed with
    // Ctrl+C must release its lock before the process exits (spec.md §4.3
    // "On shutdown ... release the lock, step down").
    let shutdown = tokio_util::sync::CancellationToken::new();
    let ctrl_c = {
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let cluster = run_cluster_loops(pool, config, client, scheduler_base, shutdown);

    let (_, server_res, ()) = tokio::join!(ctrl_c, server, cluster);
    server_res.map_err(anyhow::Error::from)
}

/// Drive heartbeat, leader election (tick loop + reconciler on acquisition),
/// and the health monitor concurrently for the lifetime of the process
/// (spec.md §5). Steps down from leadership and returns once `shutdown` is
/// cancelled (spec.md §4.3: "On shutdown ... release the lock, step down").
async fn run_cluster_loops(
    pool: PgPool,
    config: Arc<SchedulerConfig>,
    client: Arc<dyn ExecutorClient>,
    scheduler_base: String,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let registry = InstanceRegistry::new(pool.clone(), &config);
    if let Err(e) = registry.register().await {
        warn!(error = %e, "failed to register scheduler instance");
    }

    let lock: Arc<dyn LockService> = Arc::new(PostgresLock::new(pool.clone()));
    let mut elector = LeaderElector::new(lock, &config);
    let mut term = tokio_util::sync::CancellationToken::new();
    term.cancel();

    let health_monitor = HealthMonitor::new(pool.clone(), client.clone(), config.health_failure_threshold, config.health_check_deadline);

    let mut heartbeat_tick = tokio::time::interval(config.heartbeat_interval);
    let mut health_tick = tokio::time::interval(config.health_check_interval);
    let mut election_tick = tokio::time::interval(config.election_poll_interval);
    let mut cluster_tick = tokio::time::interval(config.tick_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = elector.step_down(&registry, &term).await {
                    warn!(error = %e, "step-down on shutdown failed");
                }
                break;
            }
            _ = heartbeat_tick.tick() => {
                if let Err(e) = registry.heartbeat().await {
                    warn!(error = %e, "heartbeat failed");
                }
            }
            _ = health_tick.tick() => {
                let healthy = registry.list_healthy().await.unwrap_or_default();
                let count = healthy.len().max(1);
                let index = healthy.iter().position(|i| i.instance_id == config.instance_id).unwrap_or(0);
                if let Err(e) = health_monitor.run_pass(config.health_check_interval, index, count).await {
                    warn!(error = %e, "health monitor pass failed");
                }
            }
            _ = election_tick.tick(), if elector.role() == Role::Follower => {
                match elector.try_become_leader(&registry).await {
                    Ok(Some(fresh_term)) => {
                        term = fresh_term;
                        let reconciler = Reconciler::new(
                            pool.clone(), client.clone(), scheduler_base.clone(),
                            config.reconciler_grace, config.purge_age, config.retry_base, config.retry_cap,
                        );
                        match reconciler.run().await {
                            Ok(report) => info!(
                                orphans_cancelled = report.orphans_cancelled,
                                stale_pending_redispatched = report.stale_pending_redispatched,
                                "reconciler ran on leader acquisition"
                            ),
                            Err(e) => warn!(error = %e, "reconciler pass failed on leader acquisition"),
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "leader election attempt failed"),
                }
            }
            _ = cluster_tick.tick(), if elector.role() == Role::Leader => {
                if !elector.refresh_or_step_down(&registry, &term).await.unwrap_or(false) {
                    continue;
                }
                let dispatcher = Arc::new(Dispatcher::new(
                    pool.clone(), client.clone(), scheduler_base.clone(), config.retry_base, config.retry_cap,
                ));
                let tick_loop = TickLoop::new(pool.clone(), dispatcher.clone(), config.tick_interval, config.max_concurrent_dispatches);
                if let Err(e) = tick_loop.run_once(&term).await {
                    warn!(error = %e, "tick loop pass failed");
                }
                if let Err(e) = dispatcher.run_watchdog_pass().await {
                    warn!(error = %e, "watchdog pass failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz() -> &'static str {
    "ok"
}

async fn get_cluster(State(state): State<AppState>) -> Result<Json<ClusterResponse>, AppError> {
    let registry = InstanceRegistry::new(state.pool, &state.registry_config);
    let instances = registry.list_healthy().await.map_err(AppError::internal)?;
    Ok(Json(ClusterResponse { instances }))
}

async fn create_task(State(state): State<AppState>, Json(req): Json<CreateTaskRequest>) -> Result<Json<Task>, AppError> {
    scheduler_core::cron::CronPlanner::parse(&req.cron_expression)?;

    let task = tasks_db::insert_task(
        &state.pool,
        &req.name,
        &req.cron_expression,
        &req.parameters,
        req.execution_mode,
        req.load_balance_strategy,
        req.max_retry,
        req.timeout_seconds,
    )
    .await
    .map_err(AppError::internal)?;

    Ok(Json(task))
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = tasks_db::list_tasks(&state.pool).await.map_err(AppError::internal)?;
    Ok(Json(tasks))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Task>, AppError> {
    let task = tasks_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::from(SchedulerError::not_found("task", id)))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
struct UpdateTaskRequest {
    status: Option<TaskStatus>,
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, AppError> {
    if let Some(status) = req.status {
        let rows = tasks_db::update_task_status(&state.pool, id, status).await.map_err(AppError::internal)?;
        if rows == 0 {
            return Err(AppError::from(SchedulerError::not_found("task", id)));
        }
    }
    get_task(State(state), Path(id)).await
}

async fn pause_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Task>, AppError> {
    let rows = tasks_db::update_task_status(&state.pool, id, TaskStatus::Paused).await.map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::from(SchedulerError::not_found("task", id)));
    }
    get_task(State(state), Path(id)).await
}

async fn resume_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Task>, AppError> {
    let rows = tasks_db::update_task_status(&state.pool, id, TaskStatus::Active).await.map_err(AppError::internal)?;
    if rows == 0 {
        return Err(AppError::from(SchedulerError::not_found("task", id)));
    }
    get_task(State(state), Path(id)).await
}

async fn create_assignment(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<CreateAssignmentRequest>,
) -> Result<Json<scheduler_db::models::TaskAssignment>, AppError> {
    tasks_db::get_task(&state.pool, task_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::from(SchedulerError::not_found("task", task_id)))?;

    let assignment = assignments_db::upsert_assignment(&state.pool, task_id, &req.executor_name, req.priority, req.weight)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(assignment))
}

async fn register_executor(
    State(state): State<AppState>,
    Json(req): Json<RegisterExecutorRequest>,
) -> Result<Json<Executor>, AppError> {
    let executor = executors_db::insert_executor(&state.pool, &state.registry_config.instance_id, &req.name, &req.base_url, &req.health_check_url, &req.metadata)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(executor))
}

async fn list_executors(State(state): State<AppState>) -> Result<Json<Vec<Executor>>, AppError> {
    let executors = executors_db::list_executors(&state.pool).await.map_err(AppError::internal)?;
    Ok(Json(executors))
}

async fn get_executor(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Executor>, AppError> {
    let executor = executors_db::get_executor(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::from(SchedulerError::not_found("executor", id)))?;
    Ok(Json(executor))
}

async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<Vec<TaskExecution>>, AppError> {
    let executions = executions_db::list_executions(&state.pool, query.task_id).await.map_err(AppError::internal)?;
    Ok(Json(executions))
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<TaskExecution>, AppError> {
    let execution = executions_db::get_execution(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::from(SchedulerError::not_found("execution", id)))?;
    Ok(Json(execution))
}

async fn post_callback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CallbackPayload>,
) -> Result<StatusCode, AppError> {
    state.callback_handler.handle(id, &payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

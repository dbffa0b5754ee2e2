mod config;
mod serve_cmd;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use scheduler_core::client::HttpExecutorClient;
use scheduler_db::models::{ExecutionMode, LoadBalanceStrategy};
use scheduler_db::{pool, queries};

use config::ResolvedConfig;

#[derive(Parser)]
#[command(name = "schedulerd", about = "Clustered cron-style job scheduler")]
struct Cli {
    /// Database URL (overrides SCHEDULER_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a schedulerd config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/schedulerd")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and run migrations
    DbInit,
    /// Run one cluster instance: admin HTTP API plus the background loops
    /// (heartbeat, leader election, tick, health monitor)
    Serve {
        /// Bind host (overrides SCHEDULER_HOST env var and config file)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides SCHEDULER_PORT env var and config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Executor management
    Executor {
        #[command(subcommand)]
        command: ExecutorCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a new task
    Create {
        /// Unique task name
        name: String,
        /// Cron expression (5-field, standard cron syntax)
        #[arg(long)]
        cron: String,
        /// JSON parameters passed to the executor verbatim
        #[arg(long, default_value = "{}")]
        parameters: String,
        /// parallel, sequential, or skip
        #[arg(long, default_value = "parallel")]
        execution_mode: String,
        /// round_robin, weighted_round_robin, random, sticky, or least_loaded
        #[arg(long, default_value = "round_robin")]
        load_balance_strategy: String,
        #[arg(long, default_value_t = 3)]
        max_retry: i32,
        #[arg(long, default_value_t = 300)]
        timeout_seconds: i32,
    },
    /// List all tasks
    List,
    /// Pause a task (stops future firings; in-flight executions continue)
    Pause {
        id: Uuid,
    },
    /// Resume a paused task
    Resume {
        id: Uuid,
    },
    /// Soft-delete a task
    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum ExecutorCommands {
    /// Register a new executor
    Register {
        /// Identifier of the schedulerd-side worker process proxying this
        /// executor, distinct from the executor's own name
        #[arg(long)]
        instance_id: String,
        /// Unique executor name
        name: String,
        /// Base URL the scheduler POSTs dispatches to
        #[arg(long)]
        base_url: String,
        /// URL the Health Monitor probes
        #[arg(long)]
        health_check_url: String,
        /// JSON metadata
        #[arg(long, default_value = "{}")]
        metadata: String,
    },
    /// List all executors
    List,
    /// Assign an executor to a task
    Assign {
        task_id: Uuid,
        executor_name: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long, default_value_t = 1)]
        weight: i32,
    },
}

/// Execute the `schedulerd init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: Some(db_url.to_string()) },
        instance: config::InstanceSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `schedulerd db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `schedulerd db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ResolvedConfig::resolve(cli_db_url, None, None)?;

    println!("Initializing schedulerd database...");

    let report = pool::bootstrap(&resolved.db_config).await?;
    if report.database_created {
        println!("Database created.");
    } else {
        println!("Database already existed.");
    }
    println!("Migrations applied in {:?}.", report.migration_time);
    println!("Tables:");
    for (table, count) in &report.tables {
        println!("  {table}: {count} rows");
    }

    println!("schedulerd db-init complete.");
    Ok(())
}

async fn run_task_command(command: TaskCommands, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    match command {
        TaskCommands::Create { name, cron, parameters, execution_mode, load_balance_strategy, max_retry, timeout_seconds } => {
            let parameters: Value = serde_json::from_str(&parameters).context("--parameters must be valid JSON")?;
            let execution_mode: ExecutionMode = execution_mode.parse()?;
            let load_balance_strategy: LoadBalanceStrategy = load_balance_strategy.parse()?;

            // Validate the cron expression up front rather than letting the
            // Tick Loop discover a malformed task at fire time.
            scheduler_core::cron::CronPlanner::parse(&cron)?;

            let task = queries::tasks::insert_task(
                pool,
                &name,
                &cron,
                &parameters,
                execution_mode,
                load_balance_strategy,
                max_retry,
                timeout_seconds,
            )
            .await?;
            println!("Created task {} ({})", task.id, task.name);
        }
        TaskCommands::List => {
            let tasks = queries::tasks::list_tasks(pool).await?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                println!(
                    "{}  {:<24} {:<10} cron={:<20} mode={:<10} strategy={}",
                    task.id, task.name, task.status, task.cron_expression, task.execution_mode, task.load_balance_strategy
                );
            }
        }
        TaskCommands::Pause { id } => {
            let rows = queries::tasks::update_task_status(pool, id, scheduler_db::models::TaskStatus::Paused).await?;
            anyhow::ensure!(rows > 0, "task {id} not found or already deleted");
            println!("Task {id} paused.");
        }
        TaskCommands::Resume { id } => {
            let rows = queries::tasks::update_task_status(pool, id, scheduler_db::models::TaskStatus::Active).await?;
            anyhow::ensure!(rows > 0, "task {id} not found or already deleted");
            println!("Task {id} resumed.");
        }
        TaskCommands::Delete { id } => {
            let rows = queries::tasks::soft_delete_task(pool, id).await?;
            anyhow::ensure!(rows > 0, "task {id} not found");
            println!("Task {id} deleted.");
        }
    }
    Ok(())
}

async fn run_executor_command(command: ExecutorCommands, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    match command {
        ExecutorCommands::Register { instance_id, name, base_url, health_check_url, metadata } => {
            let metadata: Value = serde_json::from_str(&metadata).context("--metadata must be valid JSON")?;
            let executor = queries::executors::insert_executor(pool, &instance_id, &name, &base_url, &health_check_url, &metadata).await?;
            println!("Registered executor {} ({})", executor.id, executor.name);
        }
        ExecutorCommands::List => {
            let executors = queries::executors::list_executors(pool).await?;
            if executors.is_empty() {
                println!("No executors.");
            }
            for executor in executors {
                println!(
                    "{}  {:<16} {:<10} healthy={:<5} {}",
                    executor.id, executor.name, executor.status, executor.is_healthy, executor.base_url
                );
            }
        }
        ExecutorCommands::Assign { task_id, executor_name, priority, weight } => {
            queries::tasks::get_task(pool, task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;
            queries::executors::get_executor_by_name(pool, &executor_name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("executor {executor_name} not found"))?;

            queries::assignments::upsert_assignment(pool, task_id, &executor_name, priority, weight).await?;
            println!("Assigned {executor_name} to task {task_id} (priority={priority}, weight={weight}).");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { host, port } => {
            let resolved = ResolvedConfig::resolve(cli.database_url.as_deref(), host.as_deref(), port)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let client: Arc<dyn scheduler_core::client::ExecutorClient> = Arc::new(HttpExecutorClient::new());
            serve_cmd::run_serve(db_pool, resolved.core, client).await?;
        }
        Commands::Task { command } => {
            let resolved = ResolvedConfig::resolve(cli.database_url.as_deref(), None, None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_task_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Executor { command } => {
            let resolved = ResolvedConfig::resolve(cli.database_url.as_deref(), None, None)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_executor_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Create a connection pool with sensible defaults.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))?;
    Ok(pool)
}

/// Apply every pending migration under `config.migrations_dir` to `pool`.
///
/// Uses a runtime `Migrator` so that no running database is required at
/// compile time (unlike the `sqlx::migrate!()` macro), which also lets
/// `config.migrations_dir` point somewhere other than this crate's own
/// source tree.
pub async fn run_migrations(pool: &PgPool, config: &DbConfig) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(config.migrations_dir.as_path()).await.with_context(|| {
        format!("failed to load migrations from {}", config.migrations_dir.display())
    })?;

    migrator.run(pool).await.context("failed to run database migrations")?;

    info!(dir = %config.migrations_dir.display(), "migrations applied successfully");
    Ok(())
}

/// Ensure the target database exists, creating it if necessary.
///
/// Connects to the `postgres` maintenance database and issues
/// `CREATE DATABASE <name>` when the target database is absent. Returns
/// whether this call is the one that created it, so callers (e.g.
/// `bootstrap`) can report that distinction to an operator.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<bool> {
    let db_name = config.database_name().context("could not determine database name from URL")?;

    let maintenance_url = config.maintenance_url();

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {maintenance_url}"))?;

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(db_name)
        .fetch_one(&maint_pool)
        .await
        .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "database already exists");
        maint_pool.close().await;
        return Ok(false);
    }

    // Database names cannot be parameterised in CREATE DATABASE, so we
    // validate the name to avoid SQL injection, then use string formatting.
    if !db_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("database name {:?} contains invalid characters", db_name);
    }
    let stmt = format!("CREATE DATABASE {db_name}");
    maint_pool.execute(stmt.as_str()).await.with_context(|| format!("failed to create database {db_name}"))?;
    info!(db = db_name, "database created");

    maint_pool.close().await;
    Ok(true)
}

/// Return the row count for every user-defined table in the `public` schema.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text \
         FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for (table_name,) in &tables {
        // Table names come from pg_tables so they are safe identifiers.
        let query = format!("SELECT COUNT(*) FROM {table_name}");
        let count: (i64,) =
            sqlx::query_as(&query).fetch_one(pool).await.with_context(|| format!("failed to count rows in {table_name}"))?;
        counts.push((table_name.clone(), count.0));
    }
    Ok(counts)
}

/// The outcome of a full bootstrap run, for `schedulerd db-init` to report.
pub struct BootstrapReport {
    /// Whether this run created the database (`false` if it already existed).
    pub database_created: bool,
    /// Wall-clock time spent applying migrations.
    pub migration_time: Duration,
    /// Row count for every table after migrations, for an operator sanity check.
    pub tables: Vec<(String, i64)>,
}

/// Create the database if absent, connect, apply migrations, and collect
/// table counts -- the full sequence behind `schedulerd db-init` and the
/// integration test harness's per-test throwaway databases.
pub async fn bootstrap(config: &DbConfig) -> Result<BootstrapReport> {
    config.validate().map_err(anyhow::Error::msg)?;

    let database_created = ensure_database_exists(config).await?;
    let pool = create_pool(config).await?;

    let started = Instant::now();
    run_migrations(&pool, config).await?;
    let migration_time = started.elapsed();

    let tables = table_counts(&pool).await?;
    pool.close().await;

    Ok(BootstrapReport { database_created, migration_time, tables })
}

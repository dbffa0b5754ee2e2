//! Shared test utilities for scheduler integration tests.
//!
//! Provides a PostgreSQL instance shared across tests. Each test gets its
//! own database within the instance, bootstrapped through the same
//! `scheduler_db::pool` primitives production code uses -- so a test
//! database is created and migrated exactly the way `schedulerd db-init`
//! creates and migrates a real one.
//!
//! Two modes:
//! - **`SCHEDULER_TEST_PG_URL`** set (nextest setup script): use the external
//!   container directly. No testcontainers overhead per process.
//! - **No env var** (`cargo test`): spin up a container via testcontainers,
//!   shared per binary through a `OnceCell`.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use scheduler_db::config::DbConfig;
use scheduler_db::pool;

/// Container start attempts before giving up. CI runners occasionally fail
/// the first pull/start under load; a couple of retries is cheaper than a
/// flaky red build.
const CONTAINER_START_ATTEMPTS: u32 = 3;

/// Shared container state: base URL and optional container handle (kept alive).
struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

/// Lazily-initialized shared PostgreSQL.
static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    // If a setup script already started a container, use that directly.
    if let Ok(url) = std::env::var("SCHEDULER_TEST_PG_URL") {
        return SharedPg { base_url: url, _container: None };
    }

    let mut last_error = None;
    for attempt in 1..=CONTAINER_START_ATTEMPTS {
        match Postgres::default().with_tag("18").start().await {
            Ok(container) => {
                let host = container.get_host().await.expect("failed to get host");
                let port = container.get_host_port_ipv4(5432).await.expect("failed to get mapped port");
                return SharedPg {
                    base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                    _container: Some(container),
                };
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "postgres test container failed to start, retrying");
                last_error = Some(e);
            }
        }
    }
    panic!("failed to start PostgreSQL container after {CONTAINER_START_ATTEMPTS} attempts: {:?}", last_error.unwrap());
}

/// Base URL for the shared PostgreSQL.
///
/// Lazily starts a container on first call (unless `SCHEDULER_TEST_PG_URL`
/// is set). The URL points at the server root (no database name appended).
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, db_name)`. The pool connects to a uniquely-named
/// database within the shared instance, created and migrated through the
/// same `scheduler_db::pool` calls `schedulerd db-init` uses. Call
/// [`drop_test_db`] with the returned `db_name` when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;
    let db_name = format!("scheduler_test_{}", Uuid::new_v4().simple());
    let config = DbConfig::new(format!("{base_url}/{db_name}"));

    pool::ensure_database_exists(&config).await.unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));

    let temp_pool = pool::create_pool(&config).await.unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    pool::run_migrations(&temp_pool, &config).await.expect("migrations should succeed");

    (temp_pool, db_name)
}

/// Drop a temporary database.
///
/// Terminates existing connections and drops the database, retrying once
/// after a short delay since `pg_terminate_backend` is asynchronous and a
/// connection can still be tearing down when `DROP DATABASE` runs. Safe to
/// call even if the database was already dropped.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_url = format!("{base_url}/postgres");

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database for cleanup");

    for attempt in 1..=2 {
        terminate_connections(&maint_pool, db_name).await;
        let dropped = maint_pool.execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str()).await;
        match dropped {
            Ok(_) => break,
            Err(e) if attempt == 1 => {
                tracing::warn!(db = db_name, error = %e, "drop database failed, retrying after lingering connections close");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(_) => break,
        }
    }

    maint_pool.close().await;
}

async fn terminate_connections(maint_pool: &PgPool, db_name: &str) {
    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;
}

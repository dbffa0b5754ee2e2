use std::env;
use std::path::PathBuf;

/// Connection and bootstrap configuration for a `scheduler-db` pool.
///
/// Bundles the connection URL together with the migrations directory that
/// should be applied against it, so a caller only has to thread one value
/// through `pool::create_pool`/`pool::bootstrap` instead of a URL plus a
/// separately-resolved path.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    /// Directory of `sqlx` migration files to apply on bootstrap.
    pub migrations_dir: PathBuf,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/scheduler";

    /// Build a config from the environment.
    ///
    /// `SCHEDULER_DATABASE_URL` overrides the URL, `SCHEDULER_MIGRATIONS_DIR`
    /// overrides the migrations directory; both fall back to compiled-in
    /// defaults when unset.
    pub fn from_env() -> Self {
        let database_url =
            env::var("SCHEDULER_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let migrations_dir = env::var("SCHEDULER_MIGRATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_migrations_dir());
        Self { database_url, migrations_dir }
    }

    /// Build a config from an explicit URL, with the default migrations
    /// directory. Useful for tests and CLI flags that only care about the
    /// connection target.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self { database_url: database_url.into(), migrations_dir: default_migrations_dir() }
    }

    /// Point this config at a non-default migrations directory.
    ///
    /// Installed binaries that ship migrations alongside themselves rather
    /// than relying on `CARGO_MANIFEST_DIR` use this to override the path
    /// baked in by [`Self::new`]/[`Self::from_env`].
    pub fn with_migrations_dir(mut self, migrations_dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = migrations_dir.into();
        self
    }

    /// Extract the database name from the URL.
    ///
    /// Returns `None` if the URL has no path component.
    pub fn database_name(&self) -> Option<&str> {
        self.database_url.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host. Used to issue `CREATE DATABASE` when the target DB does
    /// not yet exist.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => {
                let mut url = self.database_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.database_url.clone(),
        }
    }

    /// Reject connection strings that clearly aren't PostgreSQL URLs before
    /// `pool::bootstrap` ever dials out, so a mistyped `--database-url`
    /// fails with a one-line message instead of an opaque connect error.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.database_url.starts_with("postgres://") || self.database_url.starts_with("postgresql://")) {
            return Err(format!(
                "database_url must start with postgres:// or postgresql://, got {:?}",
                self.database_url
            ));
        }
        if self.database_name().is_none() {
            return Err(format!("database_url {:?} has no database name", self.database_url));
        }
        Ok(())
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Resolve the migrations directory shipped with this crate, relative to
/// `CARGO_MANIFEST_DIR` at compile time.
fn default_migrations_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_the_compiled_in_migrations_dir() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL);
        assert!(cfg.migrations_dir.ends_with("migrations"));
    }

    #[test]
    fn with_migrations_dir_overrides_the_default() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL).with_migrations_dir("/opt/schedulerd/migrations");
        assert_eq!(cfg.migrations_dir, PathBuf::from("/opt/schedulerd/migrations"));
    }

    #[test]
    fn database_name_extraction() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mydb");
        assert_eq!(cfg.database_name(), Some("mydb"));
    }

    #[test]
    fn maintenance_url_replaces_db() {
        let cfg = DbConfig::new("postgresql://localhost:5432/scheduler");
        assert_eq!(cfg.maintenance_url(), "postgresql://localhost:5432/postgres");
    }

    #[test]
    fn validate_rejects_non_postgres_schemes() {
        let cfg = DbConfig::new("mysql://localhost:3306/scheduler");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_database_name() {
        let cfg = DbConfig::new("postgresql://localhost:5432");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_a_well_formed_url() {
        let cfg = DbConfig::new("postgresql://remotehost:5433/other");
        assert_eq!(cfg.validate(), Ok(()));
    }
}

//! Configuration file management for schedulerd.
//!
//! Provides a TOML-based config file at `~/.config/schedulerd/config.toml`
//! and a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use scheduler_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub instance: InstanceSection,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct InstanceSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the schedulerd config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/schedulerd` or
/// `~/.config/schedulerd`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("schedulerd");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config").join("schedulerd")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path).with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents).with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms).with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub db_config: DbConfig,
    pub core: scheduler_core::config::SchedulerConfig,
}

impl ResolvedConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `SCHEDULER_DATABASE_URL` env > config
    ///   file's `database.url` > `DbConfig::DEFAULT_URL`
    /// - host/port: env (`SCHEDULER_HOST`/`SCHEDULER_PORT`) > config file >
    ///   `SchedulerConfig::default()`
    pub fn resolve(cli_db_url: Option<&str>, cli_host: Option<&str>, cli_port: Option<u16>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("SCHEDULER_DATABASE_URL") {
            url
        } else if let Some(url) = file_config.as_ref().and_then(|c| c.database.url.clone()) {
            url
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let mut core = scheduler_core::config::SchedulerConfig { instance_id: uuid::Uuid::new_v4().to_string(), ..Default::default() };

        if let Ok(id) = std::env::var("SCHEDULER_INSTANCE_ID") {
            core.instance_id = id;
        }

        core.host = cli_host
            .map(str::to_string)
            .or_else(|| std::env::var("SCHEDULER_HOST").ok())
            .or_else(|| file_config.as_ref().and_then(|c| c.instance.host.clone()))
            .unwrap_or(core.host);

        core.port = cli_port
            .or_else(|| std::env::var("SCHEDULER_PORT").ok().and_then(|p| p.parse().ok()))
            .or_else(|| file_config.as_ref().and_then(|c| c.instance.port))
            .unwrap_or(core.port);

        Ok(Self { db_config, core })
    }
}

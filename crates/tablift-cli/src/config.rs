//! `tablift.toml` configuration
//!
//! Looked up from `--config` / `$TABLIFT_CONFIG`, then
//! `<config dir>/tablift/config.toml`, then built-in defaults. Command line
//! flags override whatever the file says.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tablift_core::ConnectionConfig;
use tablift_migrate::MigrateOptions;

use crate::logging::LogFormat;

const DEFAULT_SQLITE_PATH: &str = "migrated.db";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub migrate: MigrateOptions,
    pub log: LogConfig,
}

/// `[database]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: String,
    /// SQLite database file
    pub path: Option<String>,
    /// PostgreSQL URL, used instead of the discrete fields when present
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            path: None,
            url: None,
            host: None,
            port: None,
            database: None,
            user: None,
            password: None,
            ssl_mode: None,
        }
    }
}

/// `[log]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load the configuration. An explicit path must exist; the default
    /// location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tablift").join("config.toml"))
    }

    /// Point the database at a PostgreSQL URL
    pub fn use_postgres_url(&mut self, url: &str) {
        self.database.driver = "postgres".to_string();
        self.database.url = Some(url.to_string());
    }

    /// Point the database at a SQLite file
    pub fn use_sqlite(&mut self, path: &Path) {
        self.database.driver = "sqlite".to_string();
        self.database.path = Some(path.to_string_lossy().into_owned());
    }
}

impl DatabaseConfig {
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        match self.driver.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(ConnectionConfig::new_sqlite(
                self.path.as_deref().unwrap_or(DEFAULT_SQLITE_PATH),
            )),
            "postgres" | "postgresql" | "pg" => {
                let mut config = match &self.url {
                    Some(url) => ConnectionConfig::new_postgres_url(url),
                    None => ConnectionConfig::new_postgres(
                        self.host.as_deref().unwrap_or("localhost"),
                        self.port.unwrap_or(0),
                        self.database.as_deref().unwrap_or("postgres"),
                        self.user.as_deref().unwrap_or("postgres"),
                    ),
                };
                config.password = self.password.clone();
                if let Some(mode) = &self.ssl_mode {
                    config = config.with_param("ssl_mode", mode.as_str());
                }
                Ok(config)
            }
            other => bail!("Unsupported database driver '{}'", other),
        }
    }
}

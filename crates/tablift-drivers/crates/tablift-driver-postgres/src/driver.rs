//! PostgreSQL driver implementation

use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use tablift_core::{Connection, ConnectionConfig, DatabaseDriver, Result, TabliftError};

use crate::PostgresConnection;
use crate::tls::ssl_mode_from_str;

const DEFAULT_PORT: u16 = 5432;

/// PostgreSQL database driver
pub struct PostgresDriver;

impl PostgresDriver {
    /// Create a new PostgreSQL driver instance
    pub fn new() -> Self {
        tracing::debug!("PostgreSQL driver initialized");
        Self
    }

    /// Translate a connection configuration into tokio-postgres settings.
    ///
    /// A `url` param wins over the discrete host/port/database fields.
    /// Returns the configuration together with the effective `sslmode`.
    pub fn build_config(config: &ConnectionConfig) -> Result<(tokio_postgres::Config, String)> {
        let ssl_mode_param = config
            .get_string("ssl_mode")
            .or_else(|| config.get_string("sslmode"));

        let mut pg_config = if let Some(url) = config.get_string("url") {
            tokio_postgres::Config::from_str(&url).map_err(|e| {
                TabliftError::Configuration(format!("Invalid PostgreSQL connection URL: {}", e))
            })?
        } else {
            let mut pg_config = tokio_postgres::Config::new();
            pg_config
                .host(config.get_string("host").as_deref().unwrap_or("localhost"))
                .port(match config.get_port() {
                    0 => DEFAULT_PORT,
                    port => port,
                })
                .dbname(config.get_string("database").as_deref().unwrap_or("postgres"));
            if let Some(user) = config.get_string("user") {
                pg_config.user(&user);
            }
            if let Some(password) = config.get_string("password") {
                pg_config.password(password);
            }
            pg_config
        };

        let ssl_mode = match ssl_mode_param {
            Some(mode) => {
                pg_config.ssl_mode(ssl_mode_from_str(&mode));
                mode
            }
            None => match pg_config.get_ssl_mode() {
                tokio_postgres::config::SslMode::Disable => "disable".to_string(),
                tokio_postgres::config::SslMode::Require => "require".to_string(),
                _ => "prefer".to_string(),
            },
        };

        Ok((pg_config, ssl_mode))
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn display_name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn default_port(&self) -> Option<u16> {
        Some(DEFAULT_PORT)
    }

    #[tracing::instrument(skip(self, config), fields(host = config.get_string("host").as_deref()))]
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        let (pg_config, ssl_mode) = Self::build_config(config)?;
        let ca_cert = config.get_string("ssl_ca_cert");

        let conn = PostgresConnection::connect(pg_config, &ssl_mode, ca_cert.as_deref())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to connect to PostgreSQL");
                e
            })?;

        Ok(Arc::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::config::{Host, SslMode};

    #[test]
    fn test_build_config_from_fields() {
        let mut config = ConnectionConfig::new_postgres("db.internal", 0, "warehouse", "loader");
        config.password = Some("secret".into());

        let (pg_config, ssl_mode) = PostgresDriver::build_config(&config).unwrap();
        assert_eq!(pg_config.get_hosts(), &[Host::Tcp("db.internal".into())]);
        assert_eq!(pg_config.get_ports(), &[5432]);
        assert_eq!(pg_config.get_dbname(), Some("warehouse"));
        assert_eq!(pg_config.get_user(), Some("loader"));
        assert_eq!(pg_config.get_password(), Some("secret".as_bytes()));
        assert_eq!(ssl_mode, "prefer");
    }

    #[test]
    fn test_build_config_from_url() {
        let config = ConnectionConfig::new_postgres_url(
            "postgres://app:pw@10.0.0.5:6543/imports?sslmode=disable",
        );

        let (pg_config, ssl_mode) = PostgresDriver::build_config(&config).unwrap();
        assert_eq!(pg_config.get_ports(), &[6543]);
        assert_eq!(pg_config.get_dbname(), Some("imports"));
        assert_eq!(pg_config.get_ssl_mode(), SslMode::Disable);
        assert_eq!(ssl_mode, "disable");
    }

    #[test]
    fn test_ssl_mode_param_overrides_url() {
        let config = ConnectionConfig::new_postgres_url("postgres://app@localhost/imports")
            .with_param("ssl_mode", "disable");
        let (pg_config, ssl_mode) = PostgresDriver::build_config(&config).unwrap();
        assert_eq!(pg_config.get_ssl_mode(), SslMode::Disable);
        assert_eq!(ssl_mode, "disable");
    }

    #[test]
    fn test_invalid_url_is_configuration_error() {
        let config = ConnectionConfig::new_postgres_url("postgres://host:notaport/db");
        assert!(matches!(
            PostgresDriver::build_config(&config),
            Err(TabliftError::Configuration(_))
        ));
    }
}

//! TLS connector construction for PostgreSQL connections.

use native_tls::{Certificate, TlsConnector};
use postgres_native_tls::MakeTlsConnector;
use std::fs;
use tablift_core::{Result, TabliftError};
use tokio_postgres::config::SslMode;

/// Map a libpq-style `sslmode` string onto what tokio-postgres understands.
///
/// `verify-ca` and `verify-full` become `Require`; certificate checking for
/// them happens in the connector built by [`make_tls_connector`].
pub fn ssl_mode_from_str(ssl_mode: &str) -> SslMode {
    match ssl_mode.to_ascii_lowercase().as_str() {
        "disable" => SslMode::Disable,
        "require" | "verify-ca" | "verify_ca" | "verify-full" | "verify_full" => SslMode::Require,
        _ => SslMode::Prefer,
    }
}

/// Build a native-tls connector for the given mode.
pub fn make_tls_connector(ssl_mode: &str, ca_cert_path: Option<&str>) -> Result<MakeTlsConnector> {
    let mode = ssl_mode.to_ascii_lowercase();
    let ca_cert_path = ca_cert_path.filter(|path| !path.is_empty());
    let mut builder = TlsConnector::builder();

    if let Some(path) = ca_cert_path {
        let pem = fs::read(path).map_err(|e| {
            TabliftError::Connection(format!("Failed to read CA certificate {}: {}", path, e))
        })?;
        let certificate = Certificate::from_pem(&pem).map_err(|e| {
            TabliftError::Connection(format!("Failed to parse CA certificate {}: {}", path, e))
        })?;
        builder.add_root_certificate(certificate);
    }

    let (accept_invalid_certs, accept_invalid_hostnames) = match mode.as_str() {
        "verify-full" | "verify_full" => (false, false),
        "verify-ca" | "verify_ca" => (false, true),
        // require/prefer/allow encrypt without verifying, as libpq does
        _ => (ca_cert_path.is_none(), true),
    };
    builder.danger_accept_invalid_certs(accept_invalid_certs);
    builder.danger_accept_invalid_hostnames(accept_invalid_hostnames);

    tracing::debug!(
        ssl_mode = %mode,
        verify_certs = !accept_invalid_certs,
        verify_hostname = !accept_invalid_hostnames,
        "building PostgreSQL TLS connector"
    );

    let connector = builder
        .build()
        .map_err(|e| TabliftError::Connection(format!("Failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_mapping() {
        assert_eq!(ssl_mode_from_str("disable"), SslMode::Disable);
        assert_eq!(ssl_mode_from_str("VERIFY-FULL"), SslMode::Require);
        assert_eq!(ssl_mode_from_str("require"), SslMode::Require);
        assert_eq!(ssl_mode_from_str("allow"), SslMode::Prefer);
        assert_eq!(ssl_mode_from_str("whatever"), SslMode::Prefer);
    }

    #[test]
    fn test_missing_ca_certificate_is_a_connection_error() {
        let result = make_tls_connector("verify-full", Some("/no/such/ca.pem"));
        assert!(matches!(result, Err(TabliftError::Connection(_))));
    }
}

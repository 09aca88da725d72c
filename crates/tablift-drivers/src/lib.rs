//! tablift drivers - database driver implementations
//!
//! This crate re-exports the concrete drivers behind cargo features and
//! provides a registry to look them up by name.

#[cfg(feature = "postgres")]
pub use tablift_driver_postgres as postgres;
#[cfg(feature = "sqlite")]
pub use tablift_driver_sqlite as sqlite;

mod registry;

pub use registry::DriverRegistry;

/// Re-export commonly used types from tablift-core
pub use tablift_core::{
    ColumnMeta, Connection, ConnectionConfig, DatabaseDriver, QueryResult, Result, Row,
    SchemaIntrospection, StatementResult, TabliftError, Transaction, Value,
};

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_connects_to_sqlite() {
        let registry = DriverRegistry::with_defaults();
        let driver = registry.get("sqlite").expect("sqlite driver registered");

        let conn = driver
            .connect(&ConnectionConfig::new_sqlite(":memory:"))
            .await
            .expect("Failed to open in-memory db");

        conn.execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            &[],
        )
        .await
        .expect("Failed to create table");
        conn.execute(
            "INSERT INTO users (name) VALUES (?)",
            &[Value::String("Alice".into())],
        )
        .await
        .expect("Failed to insert");

        let result = conn
            .query("SELECT name FROM users", &[])
            .await
            .expect("Failed to query");
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.scalar(), Some(&Value::String("Alice".into())));
    }
}

//! Connection trait and transaction handling

use crate::{
    ForeignKeyDefinition, QueryResult, Result, SchemaIntrospection, StatementResult, Value,
    transaction::{Savepoint, validate_savepoint_name},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Handle for cancelling a running query from any thread.
///
/// The handle is safe to call from any thread and can be called multiple
/// times (subsequent calls are no-ops).
pub trait QueryCancelHandle: Send + Sync {
    /// Cancel the currently running query on the associated connection.
    fn cancel(&self);
}

/// Quote an identifier with double quotes, doubling embedded quotes.
///
/// This is the ANSI form understood by both SQLite and PostgreSQL.
pub fn quote_identifier_ansi(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A database connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the driver name (e.g., "sqlite", "postgresql")
    fn driver_name(&self) -> &str;

    /// Execute a statement that modifies data or schema
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;

    /// Execute a query that returns rows (SELECT)
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Get the dialect identifier for this connection (e.g., "sqlite", "postgresql")
    fn dialect_id(&self) -> Option<&'static str> {
        None
    }

    /// Quote an identifier (table or column name) for this dialect
    fn quote_identifier(&self, name: &str) -> String {
        quote_identifier_ansi(name)
    }

    /// Bind parameter placeholder for the 1-based parameter `index`
    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// Drop a table if it exists, together with anything depending on it.
    ///
    /// The default issues `DROP TABLE IF EXISTS .. CASCADE`. Drivers without
    /// CASCADE support override this.
    async fn drop_table_cascade(&self, table: &str) -> Result<()> {
        let sql = format!(
            "DROP TABLE IF EXISTS {} CASCADE",
            self.quote_identifier(table)
        );
        self.execute(&sql, &[]).await?;
        tracing::debug!(table = %table, "table dropped");
        Ok(())
    }

    /// Add a foreign key constraint to an existing table.
    ///
    /// The default issues `ALTER TABLE .. ADD FOREIGN KEY ..`. Drivers that
    /// cannot alter constraints in place override this.
    async fn add_foreign_key(&self, fk: &ForeignKeyDefinition) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} ADD {}",
            self.quote_identifier(&fk.table),
            fk.clause(|name| self.quote_identifier(name))
        );
        self.execute(&sql, &[]).await?;
        tracing::debug!(constraint = %fk, "foreign key added");
        Ok(())
    }

    /// Begin a transaction
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;

    /// Begin a transaction in which foreign keys of other tables cannot block
    /// dropping a table. Drivers whose `drop_table_cascade` already removes
    /// dependent constraints keep the default.
    async fn begin_drop_transaction(&self) -> Result<Box<dyn Transaction>> {
        self.begin_transaction().await
    }

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get schema introspection interface if supported
    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        None
    }

    /// Get a handle that can be used to cancel running queries.
    ///
    /// Returns `None` if the driver does not support query cancellation.
    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        None
    }
}

/// A database transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;

    /// Execute a query within the transaction
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Execute a statement within the transaction
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult>;

    /// Create a savepoint with the given name.
    async fn savepoint(&self, name: &str) -> Result<Savepoint> {
        validate_savepoint_name(name)?;
        self.execute(&format!("SAVEPOINT {}", name), &[]).await?;
        Ok(Savepoint::new(name))
    }

    /// Undo everything executed after the savepoint was created.
    ///
    /// The savepoint itself remains valid and can be rolled back to again.
    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.execute(&format!("ROLLBACK TO SAVEPOINT {}", name), &[])
            .await?;
        Ok(())
    }

    /// Release (forget) a savepoint, keeping its changes.
    async fn release_savepoint(&self, name: &str) -> Result<()> {
        validate_savepoint_name(name)?;
        self.execute(&format!("RELEASE SAVEPOINT {}", name), &[])
            .await?;
        Ok(())
    }
}

//! SQLite connection implementation

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection as RusqliteConnection, InterruptHandle, OpenFlags, params_from_iter};
use std::sync::Arc;
use std::time::Duration;
use tablift_core::{
    ColumnInfo, ColumnMeta, Connection, ForeignKeyDefinition, QueryCancelHandle, QueryResult,
    Result, Row, SchemaIntrospection, StatementResult, TableInfo, TabliftError, Transaction,
    Value, quote_identifier_ansi,
};

use crate::foreign_key::add_foreign_key_by_rebuild;

/// How long a writer waits for another connection's write lock before
/// giving up with SQLITE_BUSY. Parallel file loads share one database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Cancel handle for SQLite queries.
///
/// This wraps the rusqlite `InterruptHandle` and can be called from any thread
/// to interrupt a running query. The interrupted query will return SQLITE_INTERRUPT.
pub struct SqliteCancelHandle {
    interrupt_handle: Arc<InterruptHandle>,
}

impl QueryCancelHandle for SqliteCancelHandle {
    fn cancel(&self) {
        tracing::debug!("interrupting SQLite query");
        self.interrupt_handle.interrupt();
    }
}

/// SQLite connection wrapper
pub struct SqliteConnection {
    conn: Arc<Mutex<RusqliteConnection>>,
    interrupt_handle: Arc<InterruptHandle>,
}

impl SqliteConnection {
    /// Open a SQLite database
    pub fn open(path: &str) -> Result<Self> {
        tracing::info!(path = %path, "opening SQLite database");
        let expanded_path = Self::expand_path(path)?;

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = if path == ":memory:" {
            RusqliteConnection::open_in_memory().map_err(|e| {
                TabliftError::Connection(format!("Failed to open in-memory database: {}", e))
            })?
        } else {
            if !expanded_path.starts_with("file:") {
                let file_path = std::path::Path::new(&expanded_path);
                if let Some(parent) = file_path.parent()
                    && !parent.exists()
                {
                    return Err(TabliftError::Connection(format!(
                        "Parent directory does not exist: {}",
                        parent.display()
                    )));
                }
            }

            RusqliteConnection::open_with_flags(&expanded_path, flags).map_err(|e| {
                TabliftError::Connection(format!(
                    "Failed to open SQLite database at '{}': {}",
                    expanded_path, e
                ))
            })?
        };

        conn.pragma_update(None, "foreign_keys", "ON").map_err(|e| {
            TabliftError::Connection(format!("Failed to enable foreign keys: {}", e))
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| TabliftError::Connection(format!("Failed to set journal mode: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(|e| {
            TabliftError::Connection(format!("Failed to set synchronous mode: {}", e))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| TabliftError::Connection(format!("Failed to set busy timeout: {}", e)))?;

        let interrupt_handle = Arc::new(conn.get_interrupt_handle());

        tracing::info!(path = %expanded_path, "SQLite database connection established");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt_handle,
        })
    }

    /// Expand path to handle ~ (home directory) and relative paths
    fn expand_path(path: &str) -> Result<String> {
        if path == ":memory:" || path.starts_with("file:") {
            return Ok(path.to_string());
        }

        let expanded = if let Some(rest) = path.strip_prefix("~/") {
            match std::env::var_os("HOME") {
                Some(home) => std::path::PathBuf::from(home)
                    .join(rest)
                    .to_string_lossy()
                    .to_string(),
                None => {
                    return Err(TabliftError::Configuration(
                        "Unable to determine HOME directory".into(),
                    ));
                }
            }
        } else if path.starts_with('~') {
            return Err(TabliftError::Configuration(
                "User-specific home directories (~user) are not supported".into(),
            ));
        } else {
            path.to_string()
        };

        let path_buf = std::path::PathBuf::from(&expanded);
        let result = if path_buf.is_relative() {
            std::env::current_dir()
                .map_err(TabliftError::Io)?
                .join(path_buf)
                .to_string_lossy()
                .to_string()
        } else {
            expanded
        };

        Ok(result)
    }

    /// Exact row count of a table
    async fn get_table_row_count(&self, table_name: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier_ansi(table_name));
        let result = self.query(&sql, &[]).await?;

        result
            .scalar()
            .and_then(|value| value.as_i64())
            .ok_or_else(|| TabliftError::Query("Row count is not an integer".into()))
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn driver_name(&self) -> &str {
        "sqlite"
    }

    fn dialect_id(&self) -> Option<&'static str> {
        Some("sqlite")
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let conn = self.conn.lock();
        let result = execute_locked(&conn, sql, params)?;
        tracing::debug!(affected_rows = result.affected_rows, "statement executed");
        Ok(result)
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let conn = self.conn.lock();
        let result = query_locked(&conn, sql, params)?;
        tracing::debug!(
            row_count = result.rows.len(),
            execution_time_ms = result.execution_time_ms,
            "query executed successfully"
        );
        Ok(result)
    }

    /// SQLite has no `DROP TABLE .. CASCADE`. Foreign key enforcement is
    /// switched off around the drop instead when in autocommit mode. Inside a
    /// transaction the check is only deferred to commit time, so dropping a
    /// table that leftover rows still reference needs `begin_drop_transaction`.
    #[tracing::instrument(skip(self))]
    async fn drop_table_cascade(&self, table: &str) -> Result<()> {
        let conn = self.conn.lock();
        let autocommit = conn.is_autocommit();
        let pragma = if autocommit {
            conn.pragma_update(None, "foreign_keys", "OFF")
        } else {
            conn.pragma_update(None, "defer_foreign_keys", "ON")
        };
        pragma.map_err(|e| {
            TabliftError::Query(format!("Failed to relax foreign key enforcement: {}", e))
        })?;

        let result = conn.execute(
            &format!("DROP TABLE IF EXISTS {}", quote_identifier_ansi(table)),
            [],
        );

        if autocommit && let Err(e) = conn.pragma_update(None, "foreign_keys", "ON") {
            tracing::error!(error = %e, "failed to re-enable foreign keys after drop");
        }

        result.map_err(|e| TabliftError::Query(format!("Failed to drop table {}: {}", table, e)))?;
        tracing::debug!(table = %table, "table dropped");
        Ok(())
    }

    /// SQLite cannot add a constraint to an existing table, so the table is
    /// rebuilt with the extra clause.
    #[tracing::instrument(skip(self), fields(constraint = %fk))]
    async fn add_foreign_key(&self, fk: &ForeignKeyDefinition) -> Result<()> {
        let mut conn = self.conn.lock();
        add_foreign_key_by_rebuild(&mut conn, fk)?;
        tracing::debug!("foreign key added");
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning SQLite transaction");
        {
            let conn = self.conn.lock();
            conn.execute_batch("BEGIN DEFERRED")
                .map_err(|e| TabliftError::Query(format!("Failed to begin transaction: {}", e)))?;
        }
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            committed: false,
            rolled_back: false,
            restore_foreign_keys: false,
        }))
    }

    /// `PRAGMA foreign_keys` is a no-op inside a transaction, so enforcement
    /// is switched off before `BEGIN` and back on once the transaction ends.
    async fn begin_drop_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning SQLite transaction without foreign key enforcement");
        {
            let conn = self.conn.lock();
            conn.pragma_update(None, "foreign_keys", "OFF").map_err(|e| {
                TabliftError::Query(format!("Failed to disable foreign keys: {}", e))
            })?;
            if let Err(e) = conn.execute_batch("BEGIN DEFERRED") {
                enable_foreign_keys(&conn);
                return Err(TabliftError::Query(format!("Failed to begin transaction: {}", e)));
            }
        }
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            committed: false,
            rolled_back: false,
            restore_foreign_keys: true,
        }))
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!("closing SQLite connection");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        Some(Arc::new(SqliteCancelHandle {
            interrupt_handle: self.interrupt_handle.clone(),
        }))
    }
}

#[async_trait]
impl SchemaIntrospection for SqliteConnection {
    #[tracing::instrument(skip(self))]
    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableInfo>> {
        let result = self
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await?;

        let mut tables = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let name = row
                .get(0)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let row_count = self.get_table_row_count(&name).await.ok();

            tables.push(TableInfo {
                schema: Some("main".to_string()),
                name,
                row_count,
            });
        }

        tracing::debug!(table_count = tables.len(), "tables listed");
        Ok(tables)
    }

    #[tracing::instrument(skip(self))]
    async fn get_columns(&self, _schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let result = self
            .query(
                "SELECT cid, name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
                &[Value::String(table.to_string())],
            )
            .await?;

        let columns = result
            .rows
            .iter()
            .map(|row| {
                let cid = row.get(0).and_then(|v| v.as_i64()).unwrap_or(0);
                let name = row
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let data_type = row
                    .get(2)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                let not_null = row.get(3).and_then(|v| v.as_i64()).unwrap_or(0) != 0;
                let pk = row.get(4).and_then(|v| v.as_i64()).unwrap_or(0) > 0;

                ColumnInfo {
                    name,
                    ordinal: cid as usize + 1,
                    data_type,
                    nullable: !not_null,
                    is_primary_key: pk,
                }
            })
            .collect();

        Ok(columns)
    }
}

/// SQLite transaction
///
/// Issues raw `BEGIN DEFERRED` / `COMMIT` / `ROLLBACK` SQL so that it can share
/// the connection `Arc<Mutex<..>>` without running into rusqlite's borrow-based
/// transaction lifetime requirements.
pub struct SqliteTransaction {
    conn: Arc<Mutex<RusqliteConnection>>,
    committed: bool,
    rolled_back: bool,
    /// Enforcement was switched off for this transaction
    restore_foreign_keys: bool,
}

fn enable_foreign_keys(conn: &RusqliteConnection) {
    if let Err(e) = conn.pragma_update(None, "foreign_keys", "ON") {
        tracing::error!(error = %e, "failed to re-enable foreign keys");
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.committed && !self.rolled_back {
            tracing::warn!(
                "SQLite transaction dropped without commit or rollback, issuing automatic rollback"
            );
            let conn = self.conn.lock();
            if !conn.is_autocommit()
                && let Err(e) = conn.execute_batch("ROLLBACK")
            {
                tracing::error!(error = %e, "automatic rollback on drop failed");
            }
            if self.restore_foreign_keys {
                enable_foreign_keys(&conn);
            }
        }
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.rolled_back {
            return Err(TabliftError::Query("Transaction already rolled back".into()));
        }
        if self.committed {
            return Err(TabliftError::Query("Transaction already committed".into()));
        }

        {
            let conn = self.conn.lock();
            conn.execute_batch("COMMIT")
                .map_err(|e| TabliftError::Query(format!("Failed to commit transaction: {}", e)))?;
            if self.restore_foreign_keys {
                enable_foreign_keys(&conn);
            }
        }

        self.committed = true;
        tracing::debug!("SQLite transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if self.committed {
            return Err(TabliftError::Query("Transaction already committed".into()));
        }
        if self.rolled_back {
            return Ok(());
        }

        {
            let conn = self.conn.lock();
            conn.execute_batch("ROLLBACK").map_err(|e| {
                TabliftError::Query(format!("Failed to rollback transaction: {}", e))
            })?;
            if self.restore_foreign_keys {
                enable_foreign_keys(&conn);
            }
        }

        self.rolled_back = true;
        tracing::debug!("SQLite transaction rolled back");
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing query in SQLite transaction");
        let conn = self.conn.lock();
        query_locked(&conn, sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing statement in SQLite transaction");
        let conn = self.conn.lock();
        execute_locked(&conn, sql, params)
    }
}

fn execute_locked(conn: &RusqliteConnection, sql: &str, params: &[Value]) -> Result<StatementResult> {
    let rusqlite_params = values_to_rusqlite(params);
    let rows_affected = conn
        .execute(sql, params_from_iter(rusqlite_params.iter()))
        .map_err(|e| TabliftError::Query(format!("Failed to execute statement: {}", e)))?;
    Ok(StatementResult::command(rows_affected as u64))
}

fn query_locked(conn: &RusqliteConnection, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let start_time = std::time::Instant::now();
    let rusqlite_params = values_to_rusqlite(params);

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| TabliftError::Query(format!("Failed to prepare query: {}", e)))?;

    let stmt_columns = stmt.columns();
    let mut column_names: Vec<String> = Vec::with_capacity(stmt_columns.len());
    let mut columns: Vec<ColumnMeta> = Vec::with_capacity(stmt_columns.len());
    for (idx, col) in stmt_columns.iter().enumerate() {
        let name = col.name().to_string();
        // sqlite3_column_decltype: the type from CREATE TABLE, if any
        let data_type = col.decl_type().unwrap_or("DYNAMIC").to_string();
        column_names.push(name.clone());
        columns.push(ColumnMeta {
            name,
            data_type,
            ordinal: idx,
        });
    }

    let mut rows = Vec::new();
    let mut query_rows = stmt
        .query(params_from_iter(rusqlite_params.iter()))
        .map_err(|e| TabliftError::Query(format!("Failed to execute query: {}", e)))?;

    while let Some(row) = query_rows
        .next()
        .map_err(|e| TabliftError::Query(format!("Failed to fetch row: {}", e)))?
    {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(rusqlite_to_value(row, i)?);
        }
        rows.push(Row::new(column_names.clone(), values));
    }

    Ok(QueryResult {
        id: uuid::Uuid::new_v4(),
        columns,
        rows,
        affected_rows: 0,
        execution_time_ms: start_time.elapsed().as_millis() as u64,
    })
}

/// Convert our Value types to rusqlite-compatible types
fn values_to_rusqlite(values: &[Value]) -> Vec<rusqlite::types::Value> {
    values.iter().map(value_to_rusqlite).collect()
}

fn value_to_rusqlite(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(if *b { 1 } else { 0 }),
        Value::Int16(i) => rusqlite::types::Value::Integer(*i as i64),
        Value::Int32(i) => rusqlite::types::Value::Integer(*i as i64),
        Value::Int64(i) => rusqlite::types::Value::Integer(*i),
        Value::Float32(f) => rusqlite::types::Value::Real(*f as f64),
        Value::Float64(f) => rusqlite::types::Value::Real(*f),
        Value::Decimal(d) => rusqlite::types::Value::Text(d.clone()),
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Bytes(b) => rusqlite::types::Value::Blob(b.clone()),
        Value::Date(d) => rusqlite::types::Value::Text(d.to_string()),
        Value::Time(t) => rusqlite::types::Value::Text(t.to_string()),
        Value::DateTime(dt) => rusqlite::types::Value::Text(dt.to_string()),
        Value::DateTimeUtc(dt) => rusqlite::types::Value::Text(dt.to_rfc3339()),
        Value::Json(j) => rusqlite::types::Value::Text(j.to_string()),
        Value::Uuid(u) => rusqlite::types::Value::Text(u.to_string()),
    }
}

/// Convert rusqlite row value to our Value type
fn rusqlite_to_value(row: &rusqlite::Row, idx: usize) -> Result<Value> {
    use rusqlite::types::ValueRef;

    let value_ref = row
        .get_ref(idx)
        .map_err(|e| TabliftError::Query(e.to_string()))?;

    let value = match value_ref {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(s) => Value::String(String::from_utf8_lossy(s).to_string()),
        // BLOBs in untyped columns frequently hold text
        ValueRef::Blob(b) => match std::str::from_utf8(b) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => Value::Bytes(b.to_vec()),
        },
    };

    Ok(value)
}

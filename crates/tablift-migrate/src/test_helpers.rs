//! Test scaffolding: an in-memory connection that records every statement
//!
//! ```ignore
//! let conn = Arc::new(
//!     RecordingConnection::new()
//!         .with_table("orders", &[("id", "INTEGER"), ("total", "REAL")])
//!         .fail_on("INSERT INTO \"orders\""),
//! );
//! let driver = Arc::new(RecordingDriver::new(conn.clone()));
//! // … run code against `driver` …
//! assert!(conn.executed_sql().contains(&"COMMIT".to_string()));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tablift_core::{
    ColumnInfo, Connection, ConnectionConfig, DatabaseDriver, QueryResult, Result,
    SchemaIntrospection, StatementResult, TableInfo, TabliftError, Transaction, Value,
};

#[derive(Default)]
struct Recorder {
    /// Every statement seen, transaction control included
    executed: Mutex<Vec<String>>,
    /// Parameters bound with each statement, in the same order
    params: Mutex<Vec<Vec<Value>>>,
    /// SQL substrings that make `execute` fail
    failures: Mutex<Vec<String>>,
}

impl Recorder {
    fn record(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.executed.lock().unwrap().push(sql.to_string());
        self.params.lock().unwrap().push(params.to_vec());

        let failures = self.failures.lock().unwrap();
        match failures.iter().find(|f| sql.contains(f.as_str())) {
            Some(pattern) => Err(TabliftError::Query(format!("scripted failure on '{}'", pattern))),
            None => Ok(StatementResult::command(1)),
        }
    }
}

/// A `Connection` that records SQL instead of running it
#[derive(Default)]
pub(crate) struct RecordingConnection {
    recorder: Arc<Recorder>,
    tables: HashMap<String, Vec<ColumnInfo>>,
}

impl RecordingConnection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Report `table` as existing with the given `(name, type)` columns
    pub(crate) fn with_table(mut self, table: &str, columns: &[(&str, &str)]) -> Self {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(i, (name, data_type))| ColumnInfo {
                name: name.to_string(),
                ordinal: i + 1,
                data_type: data_type.to_string(),
                nullable: true,
                is_primary_key: false,
            })
            .collect();
        self.tables.insert(table.to_string(), columns);
        self
    }

    /// Make every statement containing `pattern` fail
    pub(crate) fn fail_on(self, pattern: &str) -> Self {
        self.recorder
            .failures
            .lock()
            .unwrap()
            .push(pattern.to_string());
        self
    }

    pub(crate) fn executed_sql(&self) -> Vec<String> {
        self.recorder.executed.lock().unwrap().clone()
    }

    pub(crate) fn bound_params(&self) -> Vec<Vec<Value>> {
        self.recorder.params.lock().unwrap().clone()
    }

    /// Executed statements containing `pattern`
    pub(crate) fn executed_matching(&self, pattern: &str) -> Vec<String> {
        self.executed_sql()
            .into_iter()
            .filter(|sql| sql.contains(pattern))
            .collect()
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn driver_name(&self) -> &str {
        "recording"
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.recorder.record(sql, params)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.recorder.record(sql, params)?;
        Ok(QueryResult::empty())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        self.recorder.record("BEGIN", &[])?;
        Ok(Box::new(RecordingTransaction {
            recorder: self.recorder.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }
}

#[async_trait]
impl SchemaIntrospection for RecordingConnection {
    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableInfo>> {
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| TableInfo {
                schema: None,
                name: name.clone(),
                row_count: None,
            })
            .collect())
    }

    async fn get_columns(&self, _schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(self.tables.get(table).cloned().unwrap_or_default())
    }
}

struct RecordingTransaction {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Transaction for RecordingTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.recorder.record("COMMIT", &[]).map(|_| ())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.recorder.record("ROLLBACK", &[]).map(|_| ())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.recorder.record(sql, params)?;
        Ok(QueryResult::empty())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        self.recorder.record(sql, params)
    }
}

/// A driver handing out one shared `RecordingConnection`
pub(crate) struct RecordingDriver {
    conn: Arc<RecordingConnection>,
    refuse_connections: AtomicBool,
    connect_delay: Option<Duration>,
    writer_limit: Option<usize>,
}

impl RecordingDriver {
    pub(crate) fn new(conn: Arc<RecordingConnection>) -> Self {
        Self {
            conn,
            refuse_connections: AtomicBool::new(false),
            connect_delay: None,
            writer_limit: None,
        }
    }

    pub(crate) fn with_writer_limit(mut self, limit: usize) -> Self {
        self.writer_limit = Some(limit);
        self
    }

    /// Sleep this long in every `connect`
    pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub(crate) fn refuse_connections(self) -> Self {
        self.refuse_connections.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn config() -> ConnectionConfig {
        ConnectionConfig::new("recording", "Recording")
    }
}

#[async_trait]
impl DatabaseDriver for RecordingDriver {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn max_concurrent_writers(&self) -> Option<usize> {
        self.writer_limit
    }

    async fn connect(&self, _config: &ConnectionConfig) -> Result<Arc<dyn Connection>> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(TabliftError::Connection("connection refused".into()));
        }
        Ok(self.conn.clone())
    }
}

//! PostgreSQL connection implementation

use async_trait::async_trait;
use std::sync::Arc;
use tablift_core::{
    ColumnMeta, Connection, QueryCancelHandle, QueryResult, Result, Row, SchemaIntrospection,
    StatementResult, TabliftError, Transaction, Value,
};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, Client, NoTls, Statement};

use crate::tls::make_tls_connector;
use crate::value::{PgValue, postgres_to_value};

/// Cancel handle for PostgreSQL queries.
///
/// This wraps the tokio-postgres `CancelToken` and can be called from any thread
/// to send a cancel request to the PostgreSQL server.
pub struct PostgresCancelHandle {
    cancel_token: CancelToken,
    runtime: Handle,
}

impl QueryCancelHandle for PostgresCancelHandle {
    fn cancel(&self) {
        tracing::debug!("sending cancel request to PostgreSQL server");
        let cancel_token = self.cancel_token.clone();
        self.runtime.spawn(async move {
            if let Err(e) = cancel_token.cancel_query(NoTls).await {
                tracing::warn!(error = %e, "failed to cancel PostgreSQL query");
            }
        });
    }
}

pub(crate) fn format_postgres_error(error: &tokio_postgres::Error) -> String {
    let Some(db_error) = error.as_db_error() else {
        return error.to_string();
    };

    let mut message = db_error.message().to_string();
    for (label, part) in [
        ("detail", db_error.detail()),
        ("hint", db_error.hint()),
        ("column", db_error.column()),
    ] {
        if let Some(part) = part
            && !part.trim().is_empty()
        {
            message.push_str(&format!(" ({}: {})", label, part));
        }
    }

    describe_sqlstate(db_error.code().code(), &message)
}

/// Prefix a server message with a phrase for the SQLSTATE classes a data load
/// commonly runs into.
fn describe_sqlstate(code: &str, message: &str) -> String {
    match code {
        "23505" => format!("duplicate value violates unique constraint: {}", message),
        "23503" => format!("foreign key violation: {}", message),
        "23502" => format!("null value violates not-null constraint: {}", message),
        "22007" | "22008" => format!("invalid datetime format: {}", message),
        "22P02" => format!("invalid input syntax: {}", message),
        "22003" => format!("numeric value out of range: {}", message),
        "22001" => format!("value too long for column: {}", message),
        "42P01" => format!("undefined table: {}", message),
        "42703" => format!("undefined column: {}", message),
        "42P07" => format!("table already exists: {}", message),
        "42601" => format!("syntax error: {}", message),
        "25P02" => format!("transaction aborted: {}", message),
        _ => format!("{} (code: {})", message, code),
    }
}

/// PostgreSQL connection wrapper
pub struct PostgresConnection {
    client: Arc<Mutex<Client>>,
    cancel_token: CancelToken,
    runtime: Handle,
}

impl PostgresConnection {
    /// Connect with a prepared tokio-postgres configuration.
    ///
    /// `ssl_mode` follows libpq naming; anything but `disable` negotiates TLS
    /// through native-tls, verifying against `ssl_ca_cert` when given.
    pub async fn connect(
        config: tokio_postgres::Config,
        ssl_mode: &str,
        ssl_ca_cert: Option<&str>,
    ) -> Result<Self> {
        tracing::info!(
            hosts = ?config.get_hosts(),
            database = ?config.get_dbname(),
            ssl_mode = %ssl_mode,
            "connecting to PostgreSQL database"
        );

        let runtime = Handle::try_current().map_err(|e| {
            TabliftError::Connection(format!("PostgreSQL requires a Tokio runtime: {}", e))
        })?;

        let client = if ssl_mode.eq_ignore_ascii_case("disable") {
            let (client, connection) = config.connect(NoTls).await.map_err(|e| {
                TabliftError::Connection(format!(
                    "Failed to connect to PostgreSQL: {}",
                    format_postgres_error(&e)
                ))
            })?;
            runtime.spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });
            client
        } else {
            let tls = make_tls_connector(ssl_mode, ssl_ca_cert)?;
            let (client, connection) = config.connect(tls).await.map_err(|e| {
                TabliftError::Connection(format!(
                    "Failed to connect to PostgreSQL: {}",
                    format_postgres_error(&e)
                ))
            })?;
            runtime.spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "PostgreSQL connection error");
                }
            });
            client
        };

        tracing::info!("PostgreSQL connection established");
        Ok(Self {
            cancel_token: client.cancel_token(),
            client: Arc::new(Mutex::new(client)),
            runtime,
        })
    }
}

/// Prepare `sql` and convert `params` to the parameter types the server
/// reported for it.
async fn prepare_with_params(
    client: &Client,
    sql: &str,
    params: &[Value],
) -> Result<(Statement, Vec<PgValue>)> {
    let statement = client.prepare(sql).await.map_err(|e| {
        TabliftError::Query(format!(
            "Failed to prepare statement: {}",
            format_postgres_error(&e)
        ))
    })?;

    let param_types = statement.params();
    let pg_params = params
        .iter()
        .enumerate()
        .map(|(i, value)| match param_types.get(i) {
            Some(target_type) => PgValue::from_value_for_type(value, target_type),
            None => PgValue::from_value(value),
        })
        .collect();

    Ok((statement, pg_params))
}

fn as_sql_params(pg_params: &[PgValue]) -> Vec<&(dyn ToSql + Sync)> {
    pg_params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

async fn execute_on(client: &Client, sql: &str, params: &[Value]) -> Result<StatementResult> {
    let (statement, pg_params) = prepare_with_params(client, sql, params).await?;
    let rows_affected = client
        .execute(&statement, &as_sql_params(&pg_params))
        .await
        .map_err(|e| {
            TabliftError::Query(format!(
                "Failed to execute statement: {}",
                format_postgres_error(&e)
            ))
        })?;
    Ok(StatementResult::command(rows_affected))
}

async fn query_on(client: &Client, sql: &str, params: &[Value]) -> Result<QueryResult> {
    let start_time = std::time::Instant::now();
    let (statement, pg_params) = prepare_with_params(client, sql, params).await?;

    let pg_rows = client
        .query(&statement, &as_sql_params(&pg_params))
        .await
        .map_err(|e| {
            TabliftError::Query(format!(
                "Failed to execute query: {}",
                format_postgres_error(&e)
            ))
        })?;

    // Column metadata comes from the prepared statement so empty result sets
    // still carry their columns.
    let columns: Vec<ColumnMeta> = statement
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| ColumnMeta {
            name: col.name().to_string(),
            data_type: col.type_().name().to_string(),
            ordinal: idx,
        })
        .collect();
    let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    let mut rows = Vec::with_capacity(pg_rows.len());
    for pg_row in &pg_rows {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(postgres_to_value(pg_row, idx)?);
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

/// PostgreSQL transaction wrapper
///
/// Statements run on the connection's client between `BEGIN` and
/// `COMMIT`/`ROLLBACK`; the client lock is taken per statement.
pub struct PostgresTransaction {
    client: Arc<Mutex<Client>>,
    committed: bool,
    rolled_back: bool,
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if !self.committed && !self.rolled_back {
            tracing::warn!(
                "PostgreSQL transaction dropped without commit or rollback; the server rolls it back when the connection closes"
            );
        }
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        if self.rolled_back {
            return Err(TabliftError::Query("Transaction already rolled back".into()));
        }
        if self.committed {
            return Err(TabliftError::Query("Transaction already committed".into()));
        }

        let client = self.client.lock().await;
        client.batch_execute("COMMIT").await.map_err(|e| {
            TabliftError::Query(format!(
                "Failed to commit transaction: {}",
                format_postgres_error(&e)
            ))
        })?;
        drop(client);

        self.committed = true;
        tracing::debug!("PostgreSQL transaction committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if self.committed {
            return Err(TabliftError::Query("Transaction already committed".into()));
        }
        if self.rolled_back {
            return Ok(());
        }

        let client = self.client.lock().await;
        client.batch_execute("ROLLBACK").await.map_err(|e| {
            TabliftError::Query(format!(
                "Failed to rollback transaction: {}",
                format_postgres_error(&e)
            ))
        })?;
        drop(client);

        self.rolled_back = true;
        tracing::debug!("PostgreSQL transaction rolled back");
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing query in transaction");
        let client = self.client.lock().await;
        query_on(&client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        tracing::debug!(sql_preview = %sql.chars().take(100).collect::<String>(), "executing statement in transaction");
        let client = self.client.lock().await;
        execute_on(&client, sql, params).await
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn driver_name(&self) -> &str {
        "postgres"
    }

    fn dialect_id(&self) -> Option<&'static str> {
        Some("postgresql")
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementResult> {
        let client = self.client.lock().await;
        let result = execute_on(&client, sql, params).await?;
        tracing::debug!(affected_rows = result.affected_rows, "statement executed");
        Ok(result)
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let client = self.client.lock().await;
        let result = query_on(&client, sql, params).await?;
        tracing::debug!(
            row_count = result.rows.len(),
            execution_time_ms = result.execution_time_ms,
            "query executed successfully"
        );
        Ok(result)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        tracing::debug!("beginning PostgreSQL transaction");
        {
            let client = self.client.lock().await;
            client.batch_execute("BEGIN").await.map_err(|e| {
                TabliftError::Query(format!(
                    "Failed to begin transaction: {}",
                    format_postgres_error(&e)
                ))
            })?;
        }

        Ok(Box::new(PostgresTransaction {
            client: Arc::clone(&self.client),
            committed: false,
            rolled_back: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!("closing PostgreSQL connection");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.client.try_lock().is_ok_and(|client| client.is_closed())
    }

    fn as_schema_introspection(&self) -> Option<&dyn SchemaIntrospection> {
        Some(self)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        Some(Arc::new(PostgresCancelHandle {
            cancel_token: self.cancel_token.clone(),
            runtime: self.runtime.clone(),
        }))
    }
}

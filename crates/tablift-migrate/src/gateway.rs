//! Read-only query gateway
//!
//! The gateway is reachable by outside callers while the database account
//! can do much more than read, so anything that does not start with SELECT is
//! refused before it reaches the database.

use std::sync::Arc;

use serde::{Serialize, Serializer};
use tablift_core::{Connection, QueryResult, TabliftError, Value};

use crate::error::GatewayError;

const SAMPLE_ROWS: usize = 3;

/// A fully materialized query result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTable {
    pub columns: Vec<String>,
    #[serde(serialize_with = "serialize_rows")]
    pub rows: Vec<Vec<Value>>,
}

impl From<QueryResult> for QueryTable {
    fn from(result: QueryResult) -> Self {
        Self {
            columns: result.column_names(),
            rows: result.rows.into_iter().map(|row| row.values).collect(),
        }
    }
}

/// A table and its exact row count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub row_count: i64,
}

/// Row count plus a small sample of a table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableVerification {
    pub table: String,
    pub row_count: i64,
    pub sample: QueryTable,
}

/// Read-only access to the migrated tables
pub struct QueryGateway {
    conn: Arc<dyn Connection>,
}

impl QueryGateway {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    pub async fn close(&self) -> Result<(), GatewayError> {
        self.conn.close().await?;
        Ok(())
    }

    /// Accept only text that starts with SELECT once trimmed.
    pub fn check_policy(text: &str) -> Result<(), GatewayError> {
        if text.trim().to_uppercase().starts_with("SELECT") {
            Ok(())
        } else {
            Err(GatewayError::PolicyViolation)
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn query(&self, text: &str) -> Result<QueryTable, GatewayError> {
        Self::check_policy(text)?;
        let result = self.conn.query(text.trim(), &[]).await?;
        tracing::debug!(rows = result.row_count(), "gateway query executed");
        Ok(result.into())
    }

    /// Every table with an exact `COUNT(*)`
    pub async fn list_tables(&self) -> Result<Vec<TableSummary>, GatewayError> {
        let introspection = self.conn.as_schema_introspection().ok_or_else(|| {
            TabliftError::NotSupported(format!(
                "{} does not support schema introspection",
                self.conn.driver_name()
            ))
        })?;

        let mut summaries = Vec::new();
        for table in introspection.list_tables(None).await? {
            let row_count = self.count_rows(&table.name).await?;
            summaries.push(TableSummary {
                name: table.name,
                row_count,
            });
        }
        Ok(summaries)
    }

    /// Row count and the first rows of `table`
    pub async fn verify_table(&self, table: &str) -> Result<TableVerification, GatewayError> {
        let row_count = self.count_rows(table).await?;
        let sql = format!(
            "SELECT * FROM {} LIMIT {}",
            self.conn.quote_identifier(table),
            SAMPLE_ROWS
        );
        let sample = self.conn.query(&sql, &[]).await?;

        Ok(TableVerification {
            table: table.to_string(),
            row_count,
            sample: sample.into(),
        })
    }

    async fn count_rows(&self, table: &str) -> Result<i64, TabliftError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.conn.quote_identifier(table));
        let result = self.conn.query(&sql, &[]).await?;
        Ok(result.scalar().and_then(Value::as_i64).unwrap_or(0))
    }
}

/// Plain JSON for a cell, without the enum tag `Value`'s derive would add.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int16(v) => Json::from(*v),
        Value::Int32(v) => Json::from(*v),
        Value::Int64(v) => Json::from(*v),
        Value::Float32(v) => Json::from(*v as f64),
        Value::Float64(v) => Json::from(*v),
        Value::Json(v) => v.clone(),
        other => Json::String(other.to_string()),
    }
}

fn serialize_rows<S>(rows: &[Vec<Value>], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let rows: Vec<Vec<serde_json::Value>> = rows
        .iter()
        .map(|row| row.iter().map(value_to_json).collect())
        .collect();
    rows.serialize(serializer)
}

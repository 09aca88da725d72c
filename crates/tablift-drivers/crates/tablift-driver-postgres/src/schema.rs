//! PostgreSQL schema introspection

use async_trait::async_trait;
use tablift_core::{ColumnInfo, Connection, Result, SchemaIntrospection, TableInfo, Value};

use crate::PostgresConnection;

const DEFAULT_SCHEMA: &str = "public";

#[async_trait]
impl SchemaIntrospection for PostgresConnection {
    #[tracing::instrument(skip(self))]
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let result = self
            .query(
                "SELECT t.table_name::text, s.n_live_tup::int8
                 FROM information_schema.tables t
                 LEFT JOIN pg_stat_user_tables s
                   ON s.relname = t.table_name AND s.schemaname = t.table_schema
                 WHERE t.table_schema = $1 AND t.table_type = 'BASE TABLE'
                 ORDER BY t.table_name",
                &[Value::String(schema.to_string())],
            )
            .await?;

        let tables: Vec<TableInfo> = result
            .rows
            .iter()
            .map(|row| TableInfo {
                schema: Some(schema.to_string()),
                name: row
                    .get(0)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                row_count: row.get(1).and_then(|v| v.as_i64()),
            })
            .collect();

        tracing::debug!(table_count = tables.len(), "tables listed");
        Ok(tables)
    }

    #[tracing::instrument(skip(self))]
    async fn get_columns(&self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let result = self
            .query(
                "SELECT
                    c.column_name::text,
                    c.ordinal_position::int4,
                    CASE WHEN c.data_type = 'USER-DEFINED' THEN c.udt_name ELSE c.data_type END::text,
                    c.is_nullable = 'YES',
                    EXISTS (
                        SELECT 1
                        FROM information_schema.table_constraints tc
                        JOIN information_schema.key_column_usage k
                          ON k.constraint_name = tc.constraint_name
                         AND k.table_schema = tc.table_schema
                         AND k.table_name = tc.table_name
                        WHERE tc.constraint_type = 'PRIMARY KEY'
                          AND tc.table_schema = c.table_schema
                          AND tc.table_name = c.table_name
                          AND k.column_name = c.column_name
                    )
                 FROM information_schema.columns c
                 WHERE c.table_schema = $1 AND c.table_name = $2
                 ORDER BY c.ordinal_position",
                &[
                    Value::String(schema.to_string()),
                    Value::String(table.to_string()),
                ],
            )
            .await?;

        let columns = result
            .rows
            .iter()
            .map(|row| ColumnInfo {
                name: row
                    .get(0)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                ordinal: row.get(1).and_then(|v| v.as_i64()).unwrap_or(0) as usize,
                data_type: row
                    .get(2)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                nullable: row.get(3).and_then(|v| v.as_bool()).unwrap_or(true),
                is_primary_key: row.get(4).and_then(|v| v.as_bool()).unwrap_or(false),
            })
            .collect();

        Ok(columns)
    }
}

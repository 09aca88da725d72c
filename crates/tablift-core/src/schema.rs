//! Schema introspection types and traits

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Schema introspection capabilities
#[async_trait]
pub trait SchemaIntrospection: Send + Sync {
    /// List all base tables in a schema (the driver's default schema when `None`)
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>>;

    /// Get columns for a table, ordered by physical position.
    ///
    /// Returns an empty list when the table does not exist.
    async fn get_columns(&self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>>;
}

/// Table information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: Option<String>,
    pub name: String,
    /// Row count as reported by database statistics, if cheap to obtain
    pub row_count: Option<i64>,
}

/// Column information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Physical position, 1-based as reported by the database catalog
    pub ordinal: usize,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
}

/// A foreign key to be added to an existing table.
///
/// All names are the exact names stored by the database, without quoting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDefinition {
    /// Optional constraint name
    pub name: Option<String>,
    /// Owning (referencing) table
    pub table: String,
    /// Referencing columns
    pub columns: Vec<String>,
    /// Referenced table
    pub referenced_table: String,
    /// Referenced columns; empty means the referenced table's primary key
    pub referenced_columns: Vec<String>,
}

impl ForeignKeyDefinition {
    /// Render the `[CONSTRAINT n] FOREIGN KEY (..) REFERENCES t (..)` clause
    /// with the given identifier quoting function.
    pub fn clause(&self, quote: impl Fn(&str) -> String) -> String {
        let join = |names: &[String]| {
            names
                .iter()
                .map(|n| quote(n))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut clause = String::new();
        if let Some(name) = &self.name {
            clause.push_str(&format!("CONSTRAINT {} ", quote(name)));
        }
        clause.push_str(&format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            join(&self.columns),
            quote(&self.referenced_table)
        ));
        if !self.referenced_columns.is_empty() {
            clause.push_str(&format!(" ({})", join(&self.referenced_columns)));
        }
        clause
    }
}

impl std::fmt::Display for ForeignKeyDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}) -> {}({})",
            self.table,
            self.columns.join(", "),
            self.referenced_table,
            self.referenced_columns.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders_fk() -> ForeignKeyDefinition {
        ForeignKeyDefinition {
            name: None,
            table: "orders".into(),
            columns: vec!["customer_id".into()],
            referenced_table: "customers".into(),
            referenced_columns: vec!["customer_id".into()],
        }
    }

    #[test]
    fn test_clause_quotes_every_identifier() {
        let clause = orders_fk().clause(|n| format!("\"{}\"", n));
        assert_eq!(
            clause,
            "FOREIGN KEY (\"customer_id\") REFERENCES \"customers\" (\"customer_id\")"
        );
    }

    #[test]
    fn test_clause_with_name_and_implicit_primary_key() {
        let fk = ForeignKeyDefinition {
            name: Some("fk_orders_customer".into()),
            referenced_columns: Vec::new(),
            ..orders_fk()
        };
        let clause = fk.clause(|n| n.to_string());
        assert_eq!(
            clause,
            "CONSTRAINT fk_orders_customer FOREIGN KEY (customer_id) REFERENCES customers"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            orders_fk().to_string(),
            "orders(customer_id) -> customers(customer_id)"
        );
    }
}

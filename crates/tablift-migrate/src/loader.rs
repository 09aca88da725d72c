//! Row loader
//!
//! Loads one dataset file into one table on its own connection and inside its
//! own transaction. Every row runs under a savepoint, so a bad row is rolled
//! back alone and loading continues; PostgreSQL would otherwise abort the
//! whole transaction on the first error.

use std::fmt::Display;
use std::sync::Arc;

use tablift_core::{ColumnInfo, Connection, ConnectionConfig, DatabaseDriver, TabliftError, Value};

use crate::coerce::{NullMarkers, TypeFamily, coerce_cell};
use crate::error::MigrateError;
use crate::reconcile::{disambiguate_headers, reconcile_columns};
use crate::source::DatasetFile;

const ROW_SAVEPOINT: &str = "tablift_row";
const DEFAULT_MAX_ROW_ERRORS: usize = 100;

/// Result of loading one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub file: String,
    pub table: String,
    pub rows_inserted: u64,
    /// Row and file level errors, in the order they occurred
    pub errors: Vec<String>,
}

impl LoadOutcome {
    fn new(file: &str, table: &str) -> Self {
        Self {
            file: file.to_string(),
            table: table.to_string(),
            rows_inserted: 0,
            errors: Vec::new(),
        }
    }

    fn file_error(&mut self, error: impl Display) {
        self.errors
            .push(format!("Failed to insert data for {}: {}", self.file, error));
    }
}

/// Row error messages, capped per file
struct RowErrors<'a> {
    file: &'a str,
    cap: usize,
    kept: Vec<String>,
    suppressed: usize,
}

impl<'a> RowErrors<'a> {
    fn new(file: &'a str, cap: usize) -> Self {
        Self {
            file,
            cap,
            kept: Vec::new(),
            suppressed: 0,
        }
    }

    fn push(&mut self, row: usize, error: impl Display) {
        tracing::debug!(file = %self.file, row, error = %error, "row rejected");
        if self.kept.len() < self.cap {
            self.kept
                .push(format!("Row {} of {}: {}", row, self.file, error));
        } else {
            self.suppressed += 1;
        }
    }

    fn count(&self) -> usize {
        self.kept.len() + self.suppressed
    }

    fn into_messages(mut self) -> Vec<String> {
        if self.suppressed > 0 {
            self.kept.push(format!(
                "… and {} more row errors in {}",
                self.suppressed, self.file
            ));
        }
        self.kept
    }
}

/// Loads dataset files into existing tables
#[derive(Clone)]
pub struct RowLoader {
    driver: Arc<dyn DatabaseDriver>,
    config: ConnectionConfig,
    null_markers: NullMarkers,
    max_row_errors: usize,
}

impl RowLoader {
    pub fn new(driver: Arc<dyn DatabaseDriver>, config: ConnectionConfig) -> Self {
        Self {
            driver,
            config,
            null_markers: NullMarkers::default(),
            max_row_errors: DEFAULT_MAX_ROW_ERRORS,
        }
    }

    pub fn with_null_markers(mut self, markers: NullMarkers) -> Self {
        self.null_markers = markers;
        self
    }

    pub fn with_max_row_errors(mut self, max: usize) -> Self {
        self.max_row_errors = max;
        self
    }

    /// Load `file` into `table`.
    ///
    /// Row failures and a missing table are reported on the outcome. Only
    /// failing to connect or to begin the transaction is an error.
    #[tracing::instrument(skip(self, file), fields(file = %file.name))]
    pub async fn load(&self, file: &DatasetFile, table: &str) -> Result<LoadOutcome, MigrateError> {
        let conn = self.driver.connect(&self.config).await?;
        let outcome = self.load_on(&conn, file, table).await;
        if let Err(e) = conn.close().await {
            tracing::warn!(error = %e, "failed to close loader connection");
        }
        outcome
    }

    async fn load_on(
        &self,
        conn: &Arc<dyn Connection>,
        file: &DatasetFile,
        table: &str,
    ) -> Result<LoadOutcome, MigrateError> {
        let mut outcome = LoadOutcome::new(&file.name, table);

        let introspection = conn.as_schema_introspection().ok_or_else(|| {
            TabliftError::NotSupported(format!(
                "{} does not support schema introspection",
                conn.driver_name()
            ))
        })?;
        let columns = match introspection.get_columns(None, table).await {
            Ok(columns) => columns,
            Err(e) => {
                outcome.file_error(e);
                return Ok(outcome);
            }
        };
        if columns.is_empty() {
            outcome.file_error(format!("table '{}' does not exist", table));
            return Ok(outcome);
        }

        let content = file
            .content
            .strip_prefix('\u{feff}')
            .unwrap_or(&file.content);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(file.delimiter())
            .has_headers(false)
            .flexible(true)
            .from_reader(content.as_bytes());
        let mut records = reader.records();

        let raw_headers: Vec<String> = match records.next() {
            None => return Ok(outcome),
            Some(Ok(record)) => record.iter().map(str::to_string).collect(),
            Some(Err(e)) => {
                outcome.file_error(e);
                return Ok(outcome);
            }
        };
        let headers = disambiguate_headers(&raw_headers);
        let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let mapping = reconcile_columns(&headers, &column_names);

        let targets: Vec<(usize, &str)> = mapping.mapped().collect();
        if targets.is_empty() {
            outcome.file_error("no header column maps to a table column");
            return Ok(outcome);
        }
        let families: Vec<TypeFamily> = targets
            .iter()
            .map(|(_, name)| type_family(&columns, name))
            .collect();
        tracing::debug!(
            table = %table,
            positional = mapping.is_positional(),
            mapped = targets.len(),
            "column mapping computed"
        );

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            conn.quote_identifier(table),
            targets
                .iter()
                .map(|(_, name)| conn.quote_identifier(name))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=targets.len())
                .map(|i| conn.placeholder(i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let tx = conn.begin_transaction().await?;
        let mut row_errors = RowErrors::new(&file.name, self.max_row_errors);
        let mut inserted = 0u64;
        let mut escalated: Option<TabliftError> = None;

        for (index, record) in records.enumerate() {
            let row = index + 1;
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    row_errors.push(row, e);
                    continue;
                }
            };
            if record.len() > headers.len() {
                tracing::debug!(
                    row,
                    extra = record.len() - headers.len(),
                    "ignoring cells beyond the header"
                );
            }

            let params: Vec<Value> = targets
                .iter()
                .zip(&families)
                .map(|((position, _), family)| match record.get(*position) {
                    Some(cell) => coerce_cell(cell, *family, &self.null_markers),
                    None => Value::Null,
                })
                .collect();

            if let Err(e) = tx.savepoint(ROW_SAVEPOINT).await {
                escalated = Some(e);
                break;
            }
            let restored = match tx.execute(&sql, &params).await {
                Ok(_) => {
                    inserted += 1;
                    tx.release_savepoint(ROW_SAVEPOINT).await
                }
                Err(e) => {
                    row_errors.push(row, e);
                    match tx.rollback_to_savepoint(ROW_SAVEPOINT).await {
                        Ok(()) => tx.release_savepoint(ROW_SAVEPOINT).await,
                        Err(e) => Err(e),
                    }
                }
            };
            if let Err(e) = restored {
                escalated = Some(e);
                break;
            }
        }

        let failed_rows = row_errors.count();
        outcome.errors = row_errors.into_messages();

        // PostgreSQL answers COMMIT of an aborted transaction with a silent
        // rollback, so after an escalation nothing is committed.
        if let Some(e) = escalated {
            outcome.file_error(e);
            if let Err(e) = tx.rollback().await {
                tracing::warn!(file = %file.name, error = %e, "rollback after failed savepoint failed");
            }
        } else {
            match tx.commit().await {
                Ok(()) => outcome.rows_inserted = inserted,
                Err(e) => outcome.file_error(e),
            }
        }

        tracing::info!(
            file = %file.name,
            table = %table,
            rows = outcome.rows_inserted,
            failed_rows,
            "file loaded"
        );
        Ok(outcome)
    }
}

/// Type family of the column named `name`; unknown columns are text.
fn type_family(columns: &[ColumnInfo], name: &str) -> TypeFamily {
    columns
        .iter()
        .find(|c| c.name == name)
        .or_else(|| columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
        .map_or(TypeFamily::Text, |c| {
            TypeFamily::from_declared_type(&c.data_type)
        })
}

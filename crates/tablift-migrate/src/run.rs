//! Migration run orchestration
//!
//! A run goes drop → create → load → foreign keys. Phases never overlap and
//! are never rolled back once finished: a run aborted by a timeout or a
//! cancellation is partially applied.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::TryFutureExt;
use serde::Serialize;
use tablift_core::{ConnectionConfig, DatabaseDriver, quote_identifier_ansi};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::ddl::{
    ForeignKeyConstraint, Identifier, Statement, StatementKind, clean_schema_text,
    declared_tables, extract_foreign_keys, split_statements,
};
use crate::error::MigrateError;
use crate::loader::{LoadOutcome, RowLoader};
use crate::materializer::Materializer;
use crate::naming::resolve_table;
use crate::oracle::SchemaOracle;
use crate::options::MigrateOptions;
use crate::source::DatasetFile;

/// One schema statement, ready to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStep {
    /// The statement with its foreign keys stripped
    pub statement: Statement,
    /// False when a foreign key element could not be parsed and was left in
    pub complete: bool,
    /// Constraints deferred from this statement
    pub constraints: Vec<ForeignKeyConstraint>,
}

impl SchemaStep {
    fn is_deferred(&self) -> bool {
        self.statement.kind == StatementKind::AddForeignKey && !self.constraints.is_empty()
    }
}

/// Schema text analysed without a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedRun {
    /// Effective DDL: the executed statements, then the deferred constraints
    pub ddl: String,
    /// Declared tables in declaration order
    pub tables: Vec<Identifier>,
    pub steps: Vec<SchemaStep>,
    /// Deferred constraints in declaration order
    pub foreign_keys: Vec<ForeignKeyConstraint>,
}

/// Clean, split and strip schema text.
pub fn prepare_run(schema_text: &str) -> PreparedRun {
    let cleaned = clean_schema_text(schema_text);
    let statements = split_statements(&cleaned);
    let tables = declared_tables(&statements);

    let steps: Vec<SchemaStep> = statements
        .iter()
        .map(|statement| {
            let extraction = extract_foreign_keys(statement);
            SchemaStep {
                statement: extraction.statement,
                complete: extraction.complete,
                constraints: extraction.constraints,
            }
        })
        .collect();
    let foreign_keys: Vec<ForeignKeyConstraint> = steps
        .iter()
        .flat_map(|step| step.constraints.iter().cloned())
        .collect();

    let mut sections = Vec::new();
    let executed: Vec<&str> = steps
        .iter()
        .filter(|step| !step.is_deferred())
        .map(|step| step.statement.text.as_str())
        .collect();
    if !executed.is_empty() {
        sections.push(format!("{};", executed.join(";\n\n")));
    }
    if !foreign_keys.is_empty() {
        let alters: Vec<String> = foreign_keys
            .iter()
            .map(|fk| {
                let definition = fk.to_definition();
                format!(
                    "ALTER TABLE {} ADD {};",
                    quote_identifier_ansi(&definition.table),
                    definition.clause(quote_identifier_ansi)
                )
            })
            .collect();
        sections.push(alters.join("\n"));
    }

    PreparedRun {
        ddl: sections.join("\n\n"),
        tables,
        steps,
        foreign_keys,
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Table names as written in the schema, in declaration order
    pub tables_created: Vec<String>,
    /// Inserted rows per file display name
    pub rows_inserted: BTreeMap<String, u64>,
    /// Non-fatal errors: downloads, then schema, loads and constraints
    pub errors: Vec<String>,
    pub success: bool,
    pub ddl: String,
    pub foreign_keys_applied: usize,
    pub duration_ms: u64,
}

impl MigrationReport {
    pub fn total_rows(&self) -> u64 {
        self.rows_inserted.values().sum()
    }
}

/// Migrates a set of files into a database
pub struct MigrationRun {
    driver: Arc<dyn DatabaseDriver>,
    config: ConnectionConfig,
    options: MigrateOptions,
    download_errors: Vec<String>,
}

impl MigrationRun {
    pub fn new(
        driver: Arc<dyn DatabaseDriver>,
        config: ConnectionConfig,
        options: MigrateOptions,
    ) -> Self {
        Self {
            driver,
            config,
            options,
            download_errors: Vec::new(),
        }
    }

    /// Errors from fetching the files, reported ahead of the run's own
    pub fn with_download_errors(mut self, errors: Vec<String>) -> Self {
        self.download_errors = errors;
        self
    }

    /// Ask `oracle` for the schema, then run [`MigrationRun::execute`].
    pub async fn execute_with_oracle(
        &self,
        files: Vec<DatasetFile>,
        oracle: &dyn SchemaOracle,
    ) -> Result<MigrationReport, MigrateError> {
        if files.is_empty() {
            return Err(MigrateError::NoFiles);
        }
        let schema = self
            .run_phase(
                "schema inference",
                oracle.infer_schema(&files).map_err(MigrateError::from),
            )
            .await?;
        self.execute(files, &schema).await
    }

    /// Materialize `schema_text` and load `files` into it.
    #[tracing::instrument(skip_all, fields(files = files.len(), driver = self.driver.name()))]
    pub async fn execute(
        &self,
        files: Vec<DatasetFile>,
        schema_text: &str,
    ) -> Result<MigrationReport, MigrateError> {
        let started = Instant::now();
        if files.is_empty() {
            return Err(MigrateError::NoFiles);
        }

        let prepared = prepare_run(schema_text);
        let targets: Vec<String> = files
            .iter()
            .map(|file| resolve_table(&file.name, &prepared.tables))
            .collect();
        check_table_conflicts(&files, &targets)?;
        tracing::info!(
            tables = prepared.tables.len(),
            constraints = prepared.foreign_keys.len(),
            "migration started"
        );

        let materializer = Materializer::new(self.driver.clone(), self.config.clone());
        self.run_phase("drop", materializer.drop_tables(&prepared.tables))
            .await?;
        let created = self
            .run_phase("create", materializer.create_tables(&prepared.steps))
            .await?;
        let loads = self.run_phase("load", self.load_all(files, targets)).await?;
        let constraints = self
            .run_phase(
                "foreign keys",
                materializer.apply_foreign_keys(&prepared.foreign_keys, &prepared.tables),
            )
            .await?;

        let mut errors = self.download_errors.clone();
        errors.extend(created.errors);
        let mut rows_inserted = BTreeMap::new();
        for outcome in loads {
            errors.extend(outcome.errors);
            rows_inserted.insert(outcome.file, outcome.rows_inserted);
        }
        errors.extend(constraints.errors);

        let report = MigrationReport {
            tables_created: created.created,
            rows_inserted,
            success: errors.is_empty(),
            errors,
            ddl: prepared.ddl,
            foreign_keys_applied: constraints.applied,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        tracing::info!(
            tables = report.tables_created.len(),
            rows = report.total_rows(),
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "migration finished"
        );
        Ok(report)
    }

    /// `max_parallel_loads`, capped by what the driver can write at once
    fn load_parallelism(&self) -> usize {
        let limit = self.driver.max_concurrent_writers().unwrap_or(usize::MAX);
        self.options.max_parallel_loads.min(limit).max(1)
    }

    /// Load every file on its own connection, at most `load_parallelism()`
    /// at a time. Outcomes come back in input order.
    async fn load_all(
        &self,
        files: Vec<DatasetFile>,
        targets: Vec<String>,
    ) -> Result<Vec<LoadOutcome>, MigrateError> {
        let loader = Arc::new(
            RowLoader::new(self.driver.clone(), self.config.clone())
                .with_null_markers(self.options.null_markers.clone())
                .with_max_row_errors(self.options.max_row_errors),
        );
        let semaphore = Arc::new(Semaphore::new(self.load_parallelism()));
        let mut slots: Vec<(String, String)> = Vec::with_capacity(files.len());
        let mut tasks = JoinSet::new();

        for (index, (file, table)) in files.into_iter().zip(targets).enumerate() {
            slots.push((file.name.clone(), table.clone()));
            let loader = loader.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, loader.load(&file, &table).await)
            });
        }

        let mut finished: Vec<(usize, LoadOutcome)> = Vec::with_capacity(slots.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(outcome))) => finished.push((index, outcome)),
                Ok((_, Err(e))) => return Err(e),
                Err(e) => tracing::error!(error = %e, "load task failed"),
            }
        }

        // a task that panicked left no outcome behind
        let done: HashSet<usize> = finished.iter().map(|(index, _)| *index).collect();
        for (index, (file, table)) in slots.into_iter().enumerate() {
            if !done.contains(&index) {
                finished.push((
                    index,
                    LoadOutcome {
                        errors: vec![format!("Failed to insert data for {}: load task failed", file)],
                        file,
                        table,
                        rows_inserted: 0,
                    },
                ));
            }
        }

        finished.sort_by_key(|(index, _)| *index);
        Ok(finished.into_iter().map(|(_, outcome)| outcome).collect())
    }

    /// Run one phase under the configured timeout and cancellation token
    async fn run_phase<T, F>(&self, phase: &'static str, work: F) -> Result<T, MigrateError>
    where
        F: Future<Output = Result<T, MigrateError>>,
    {
        let cancellation = self.options.cancellation.clone().unwrap_or_default();
        if cancellation.is_cancelled() {
            return Err(MigrateError::Cancelled { phase });
        }
        tracing::debug!(phase, "phase started");

        let bounded = async {
            match self.options.phase_timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(MigrateError::Timeout { phase }),
                },
                None => work.await,
            }
        };
        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(MigrateError::Cancelled { phase }),
            result = bounded => result,
        };

        if let Err(e) = &result {
            tracing::warn!(phase, error = %e, "phase aborted");
        }
        result
    }
}

/// Two files must not load into the same table
fn check_table_conflicts(files: &[DatasetFile], targets: &[String]) -> Result<(), MigrateError> {
    let mut by_table: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (file, table) in files.iter().zip(targets) {
        by_table
            .entry(table.as_str())
            .or_default()
            .push(file.name.as_str());
    }

    match by_table.into_iter().find(|(_, names)| names.len() > 1) {
        Some((table, names)) => Err(MigrateError::TableNameConflict {
            table: table.to_string(),
            files: names.into_iter().map(str::to_string).collect(),
        }),
        None => Ok(()),
    }
}

//! Table materializer
//!
//! Drops and recreates the declared tables, then applies the deferred
//! foreign keys once the data is in. Each unit runs on its own connection
//! and the connection is closed on every exit path.

use std::sync::Arc;

use tablift_core::{Connection, ConnectionConfig, DatabaseDriver, Transaction};

use crate::ddl::{ForeignKeyConstraint, Identifier, Statement, StatementKind};
use crate::error::MigrateError;
use crate::run::SchemaStep;

const STATEMENT_SAVEPOINT: &str = "tablift_stmt";
const SUMMARY_CHARS: usize = 60;

/// Tables created by [`Materializer::create_tables`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOutcome {
    /// Table names as written, in declaration order, each listed once
    pub created: Vec<String>,
    /// Non-fatal statement errors
    pub errors: Vec<String>,
}

/// Result of the deferred foreign key pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintOutcome {
    pub applied: usize,
    pub errors: Vec<String>,
}

pub struct Materializer {
    driver: Arc<dyn DatabaseDriver>,
    config: ConnectionConfig,
}

impl Materializer {
    pub fn new(driver: Arc<dyn DatabaseDriver>, config: ConnectionConfig) -> Self {
        Self { driver, config }
    }

    /// Drop `tables` in reverse declaration order inside one transaction.
    #[tracing::instrument(skip_all, fields(tables = tables.len()))]
    pub async fn drop_tables(&self, tables: &[Identifier]) -> Result<(), MigrateError> {
        let conn = self.driver.connect(&self.config).await?;
        let result = drop_all(&conn, tables).await;
        close(&conn).await;
        result
    }

    /// Execute the schema steps in declaration order inside one transaction.
    ///
    /// Deferred `ALTER TABLE … ADD FOREIGN KEY` steps are skipped. A failing
    /// CREATE TABLE rolls everything back and aborts, unless its foreign key
    /// surgery was incomplete; then, like any other failing statement, it is
    /// reported and creation continues.
    #[tracing::instrument(skip_all, fields(steps = steps.len()))]
    pub async fn create_tables(&self, steps: &[SchemaStep]) -> Result<CreateOutcome, MigrateError> {
        let conn = self.driver.connect(&self.config).await?;
        let result = create_all(&conn, steps).await;
        close(&conn).await;
        result
    }

    /// Apply each distinct constraint once, outside a transaction.
    ///
    /// Every failure is reported and the pass moves on; rows already loaded
    /// are never touched.
    #[tracing::instrument(skip_all, fields(constraints = constraints.len()))]
    pub async fn apply_foreign_keys(
        &self,
        constraints: &[ForeignKeyConstraint],
        declared: &[Identifier],
    ) -> Result<ConstraintOutcome, MigrateError> {
        if constraints.is_empty() {
            return Ok(ConstraintOutcome::default());
        }
        let conn = self.driver.connect(&self.config).await?;
        let outcome = apply_all(&conn, constraints, declared).await;
        close(&conn).await;
        Ok(outcome)
    }
}

async fn drop_all(conn: &Arc<dyn Connection>, tables: &[Identifier]) -> Result<(), MigrateError> {
    let tx = conn.begin_drop_transaction().await?;
    for table in tables.iter().rev() {
        if let Err(e) = conn.drop_table_cascade(&table.sql_name()).await {
            rollback(tx).await;
            return Err(e.into());
        }
    }
    tx.commit().await?;
    tracing::info!(tables = tables.len(), "existing tables dropped");
    Ok(())
}

async fn create_all(
    conn: &Arc<dyn Connection>,
    steps: &[SchemaStep],
) -> Result<CreateOutcome, MigrateError> {
    let tx = conn.begin_transaction().await?;
    let mut created: Vec<&Identifier> = Vec::new();
    let mut outcome = CreateOutcome::default();

    for step in steps {
        let statement = &step.statement;
        if statement.kind == StatementKind::AddForeignKey && !step.constraints.is_empty() {
            continue;
        }
        let table = statement
            .table
            .as_ref()
            .filter(|_| statement.is_create_table());
        let redeclared = table.filter(|t| created.iter().any(|c| c.same_name(t)));

        tx.savepoint(STATEMENT_SAVEPOINT).await?;
        match execute_step(conn, tx.as_ref(), statement, redeclared).await {
            Ok(()) => {
                tx.release_savepoint(STATEMENT_SAVEPOINT).await?;
                if let Some(table) = table {
                    tracing::debug!(table = %table, "table created");
                    if redeclared.is_none() {
                        created.push(table);
                    }
                }
            }
            Err(e) => {
                tx.rollback_to_savepoint(STATEMENT_SAVEPOINT).await?;
                tx.release_savepoint(STATEMENT_SAVEPOINT).await?;
                match table {
                    Some(table) if step.complete => {
                        tracing::error!(table = %table, error = %e, "table creation failed");
                        rollback(tx).await;
                        return Err(MigrateError::SchemaCreation {
                            table: table.value.clone(),
                            message: e.to_string(),
                        });
                    }
                    Some(table) => outcome
                        .errors
                        .push(format!("Failed to create table {}: {}", table.value, e)),
                    None => outcome.errors.push(format!(
                        "Failed to execute statement '{}': {}",
                        summarize(&statement.text),
                        e
                    )),
                }
            }
        }
    }

    tx.commit().await?;
    outcome.created = created.iter().map(|t| t.value.clone()).collect();
    tracing::info!(tables = outcome.created.len(), "tables created");
    Ok(outcome)
}

/// Run one statement, dropping a redeclared table right before its new CREATE
async fn execute_step(
    conn: &Arc<dyn Connection>,
    tx: &dyn Transaction,
    statement: &Statement,
    redeclared: Option<&Identifier>,
) -> tablift_core::Result<()> {
    if let Some(table) = redeclared {
        tracing::debug!(table = %table, "table declared again, dropping the earlier one");
        conn.drop_table_cascade(&table.sql_name()).await?;
    }
    tx.execute(&statement.text, &[]).await?;
    Ok(())
}

async fn apply_all(
    conn: &Arc<dyn Connection>,
    constraints: &[ForeignKeyConstraint],
    declared: &[Identifier],
) -> ConstraintOutcome {
    let mut outcome = ConstraintOutcome::default();
    let mut attempted: Vec<&ForeignKeyConstraint> = Vec::new();

    for fk in constraints {
        if attempted.contains(&fk) {
            continue;
        }
        attempted.push(fk);

        if !declared.iter().any(|t| t.same_name(&fk.referenced_table)) {
            outcome.errors.push(format!(
                "Foreign key {} references undeclared table {}",
                fk.source(),
                fk.referenced_table
            ));
            continue;
        }

        match conn.add_foreign_key(&fk.to_definition()).await {
            Ok(()) => {
                tracing::info!(constraint = %fk, "foreign key applied");
                outcome.applied += 1;
            }
            Err(e) => {
                tracing::warn!(constraint = %fk, error = %e, "foreign key rejected");
                outcome
                    .errors
                    .push(format!("Failed to add foreign key {}: {}", fk, e));
            }
        }
    }
    outcome
}

async fn rollback(tx: Box<dyn Transaction>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

async fn close(conn: &Arc<dyn Connection>) {
    if let Err(e) = conn.close().await {
        tracing::warn!(error = %e, "failed to close connection");
    }
}

/// First line of a statement, shortened for error messages
fn summarize(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() > SUMMARY_CHARS {
        format!("{}…", line.chars().take(SUMMARY_CHARS).collect::<String>())
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::prepare_run;
    use crate::test_helpers::{RecordingConnection, RecordingDriver};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    const SCHEMA: &str = indoc! {r#"
        CREATE TABLE customers (customer_id INTEGER PRIMARY KEY, name TEXT);
        CREATE TABLE "Orders" (
            order_id INTEGER PRIMARY KEY,
            customer_id INTEGER,
            FOREIGN KEY (customer_id) REFERENCES customers(customer_id)
        );
    "#};

    fn materializer(conn: &Arc<RecordingConnection>) -> Materializer {
        Materializer::new(
            Arc::new(RecordingDriver::new(conn.clone())),
            RecordingDriver::config(),
        )
    }

    #[tokio::test]
    async fn test_drop_in_reverse_declaration_order() {
        let conn = Arc::new(RecordingConnection::new());
        let prepared = prepare_run(SCHEMA);

        materializer(&conn).drop_tables(&prepared.tables).await.unwrap();

        assert_eq!(
            conn.executed_sql(),
            vec![
                "BEGIN",
                "DROP TABLE IF EXISTS \"Orders\" CASCADE",
                "DROP TABLE IF EXISTS \"customers\" CASCADE",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_drop_rolls_back() {
        let conn = Arc::new(RecordingConnection::new().fail_on("DROP TABLE"));
        let prepared = prepare_run(SCHEMA);

        let err = materializer(&conn)
            .drop_tables(&prepared.tables)
            .await
            .unwrap_err();

        assert!(matches!(err, MigrateError::Database(_)));
        assert_eq!(conn.executed_sql().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_create_executes_stripped_statements() {
        let conn = Arc::new(RecordingConnection::new());
        let prepared = prepare_run(SCHEMA);

        let outcome = materializer(&conn)
            .create_tables(&prepared.steps)
            .await
            .unwrap();

        assert_eq!(outcome.created, vec!["customers", "Orders"]);
        assert!(outcome.errors.is_empty());
        let creates = conn.executed_matching("CREATE TABLE");
        assert_eq!(creates.len(), 2);
        assert!(!creates[1].contains("FOREIGN KEY"), "{}", creates[1]);
        assert_eq!(conn.executed_sql().last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn test_failing_create_is_fatal() {
        let conn = Arc::new(RecordingConnection::new().fail_on("CREATE TABLE customers"));
        let prepared = prepare_run(SCHEMA);

        let err = materializer(&conn)
            .create_tables(&prepared.steps)
            .await
            .unwrap_err();

        match err {
            MigrateError::SchemaCreation { table, message } => {
                assert_eq!(table, "customers");
                assert!(message.contains("scripted failure"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let sql = conn.executed_sql();
        assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
        assert!(conn.executed_matching("\"Orders\"").is_empty());
    }

    #[tokio::test]
    async fn test_failing_other_statement_is_reported() {
        let conn = Arc::new(RecordingConnection::new().fail_on("CREATE INDEX"));
        let prepared = prepare_run(
            "CREATE TABLE a (id INTEGER);\nCREATE INDEX idx_a ON a (id);\nCREATE TABLE b (id INTEGER);",
        );

        let outcome = materializer(&conn)
            .create_tables(&prepared.steps)
            .await
            .unwrap();

        assert_eq!(outcome.created, vec!["a", "b"]);
        assert_eq!(
            outcome.errors,
            vec!["Failed to execute statement 'CREATE INDEX idx_a ON a (id)': Query error: scripted failure on 'CREATE INDEX'"]
        );
        assert_eq!(
            conn.executed_matching("SAVEPOINT tablift_stmt").len(),
            2 + 3 + 2
        );
    }

    #[tokio::test]
    async fn test_redeclared_table_is_dropped_and_listed_once() {
        let conn = Arc::new(RecordingConnection::new());
        let prepared = prepare_run("CREATE TABLE a (id INTEGER);\nCREATE TABLE A (id INTEGER, v TEXT);");

        let outcome = materializer(&conn)
            .create_tables(&prepared.steps)
            .await
            .unwrap();

        assert_eq!(outcome.created, vec!["a"]);
        let sql = conn.executed_sql();
        let drop = sql
            .iter()
            .position(|s| s == "DROP TABLE IF EXISTS \"a\" CASCADE")
            .unwrap();
        assert_eq!(sql[drop + 1], "CREATE TABLE A (id INTEGER, v TEXT)");
    }

    #[tokio::test]
    async fn test_deferred_alter_statements_are_not_executed() {
        let conn = Arc::new(RecordingConnection::new());
        let prepared = prepare_run(indoc! {"
            CREATE TABLE a (id INTEGER PRIMARY KEY);
            CREATE TABLE b (a_id INTEGER);
            ALTER TABLE b ADD CONSTRAINT fk_b_a FOREIGN KEY (a_id) REFERENCES a (id);
        "});

        materializer(&conn)
            .create_tables(&prepared.steps)
            .await
            .unwrap();

        assert!(conn.executed_matching("ALTER TABLE").is_empty());
        assert_eq!(prepared.foreign_keys.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_keys_are_applied_independently() {
        let conn = Arc::new(RecordingConnection::new().fail_on("REFERENCES \"customers\""));
        let prepared = prepare_run(indoc! {"
            CREATE TABLE customers (id INTEGER PRIMARY KEY);
            CREATE TABLE products (id INTEGER PRIMARY KEY);
            CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                customer_id INTEGER REFERENCES customers(id),
                product_id INTEGER REFERENCES products(id),
                warehouse_id INTEGER REFERENCES warehouses(id)
            );
        "});

        let outcome = materializer(&conn)
            .apply_foreign_keys(&prepared.foreign_keys, &prepared.tables)
            .await
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.errors.len(), 2);
        assert!(
            outcome.errors[0]
                .starts_with("Failed to add foreign key orders(customer_id) -> customers(id): "),
            "{}",
            outcome.errors[0]
        );
        assert_eq!(
            outcome.errors[1],
            "Foreign key orders(warehouse_id) references undeclared table warehouses"
        );
        // no transaction around the pass
        assert!(conn.executed_matching("BEGIN").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_constraints_are_applied_once() {
        let conn = Arc::new(RecordingConnection::new());
        let prepared = prepare_run(indoc! {"
            CREATE TABLE a (id INTEGER PRIMARY KEY);
            CREATE TABLE b (a_id INTEGER, FOREIGN KEY (a_id) REFERENCES a (id));
            ALTER TABLE b ADD FOREIGN KEY (a_id) REFERENCES a (id);
        "});

        let outcome = materializer(&conn)
            .apply_foreign_keys(&prepared.foreign_keys, &prepared.tables)
            .await
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(conn.executed_matching("ALTER TABLE").len(), 1);
    }

    #[test]
    fn test_summarize_long_statement() {
        let text = format!("CREATE VIEW v AS SELECT {}\nFROM t", "x, ".repeat(40));
        let summary = summarize(&text);
        assert!(summary.ends_with('…'));
        assert_eq!(summary.chars().count(), SUMMARY_CHARS + 1);
    }
}

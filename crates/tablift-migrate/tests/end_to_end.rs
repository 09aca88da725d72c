//! Full migrations against SQLite database files

use std::sync::Arc;

use indoc::indoc;
use pretty_assertions::assert_eq;
use tablift_core::{Connection, ConnectionConfig, DatabaseDriver, Value};
use tablift_drivers::sqlite::SqliteDriver;
use tablift_migrate::{
    DatasetFile, GatewayError, MigrateOptions, MigrationReport, MigrationRun, QueryGateway,
};

const SHOP_SCHEMA: &str = indoc! {"
    CREATE TABLE customers (
        customer_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    );

    CREATE TABLE orders (
        order_id INTEGER PRIMARY KEY,
        customer_id INTEGER,
        total REAL,
        FOREIGN KEY (customer_id) REFERENCES customers(customer_id) ON DELETE CASCADE
    );
"};

struct Target {
    _dir: tempfile::TempDir,
    config: ConnectionConfig,
}

impl Target {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migrated.db");
        let config = ConnectionConfig::new_sqlite(path.to_str().unwrap());
        Self { _dir: dir, config }
    }

    fn run(&self) -> MigrationRun {
        MigrationRun::new(
            Arc::new(SqliteDriver::new()),
            self.config.clone(),
            MigrateOptions::default(),
        )
    }

    async fn migrate(&self, files: Vec<DatasetFile>, schema: &str) -> MigrationReport {
        self.run().execute(files, schema).await.unwrap()
    }

    async fn connect(&self) -> Arc<dyn Connection> {
        SqliteDriver::new().connect(&self.config).await.unwrap()
    }

    async fn scalar(&self, sql: &str) -> Value {
        let conn = self.connect().await;
        conn.query(sql, &[])
            .await
            .unwrap()
            .scalar()
            .cloned()
            .unwrap_or(Value::Null)
    }

    async fn count(&self, sql: &str) -> i64 {
        self.scalar(sql).await.as_i64().unwrap()
    }
}

fn customers() -> DatasetFile {
    DatasetFile::new("customers.csv", "customer_id,name\n1,Ada\n2,Grace\n")
}

#[tokio::test]
async fn test_orphan_orders_are_loaded_and_one_constraint_fails() {
    let target = Target::new();
    let orders = DatasetFile::new(
        "orders.csv",
        "order_id,customer_id,total\n10,1,9.5\n11,2,20\n12,99,1.25\n",
    );

    let report = target.migrate(vec![orders, customers()], SHOP_SCHEMA).await;

    assert_eq!(report.tables_created, vec!["customers", "orders"]);
    assert_eq!(report.rows_inserted.get("orders.csv"), Some(&3));
    assert_eq!(report.rows_inserted.get("customers.csv"), Some(&2));
    assert_eq!(report.foreign_keys_applied, 0);
    assert!(!report.success);
    assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
    assert!(
        report.errors[0]
            .starts_with("Failed to add foreign key orders(customer_id) -> customers(customer_id): "),
        "{}",
        report.errors[0]
    );

    assert_eq!(target.count("SELECT COUNT(*) FROM orders").await, 3);
}

#[tokio::test]
async fn test_consistent_data_gets_its_foreign_key() {
    let target = Target::new();
    let orders = DatasetFile::new("orders.csv", "order_id,customer_id,total\n10,1,9.5\n11,2,20\n");

    let report = target.migrate(vec![customers(), orders], SHOP_SCHEMA).await;

    assert!(report.success, "{:?}", report.errors);
    assert_eq!(report.foreign_keys_applied, 1);
    assert_eq!(
        target
            .count("SELECT COUNT(*) FROM pragma_foreign_key_list('orders')")
            .await,
        1
    );
    assert!(report.ddl.contains("ALTER TABLE \"orders\" ADD FOREIGN KEY"));
}

#[tokio::test]
async fn test_forward_references_do_not_block_creation() {
    let target = Target::new();
    let schema = indoc! {"
        CREATE TABLE orders (
            order_id INTEGER PRIMARY KEY,
            customer_id INTEGER REFERENCES customers(customer_id)
        );
        CREATE TABLE customers (customer_id INTEGER PRIMARY KEY, name TEXT);
    "};
    let orders = DatasetFile::new("orders.csv", "order_id,customer_id\n10,2\n");

    let report = target.migrate(vec![orders, customers()], schema).await;

    assert_eq!(report.tables_created, vec!["orders", "customers"]);
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(report.foreign_keys_applied, 1);
}

#[tokio::test]
async fn test_rerun_drops_a_parent_that_leftover_rows_still_reference() {
    let target = Target::new();
    let orders = DatasetFile::new("orders.csv", "order_id,customer_id,total\n10,1,9.5\n11,2,20\n");
    let first = target.migrate(vec![customers(), orders], SHOP_SCHEMA).await;
    assert_eq!(first.foreign_keys_applied, 1);

    let schema = "CREATE TABLE customers (customer_id INTEGER PRIMARY KEY, name TEXT NOT NULL);";
    let newcomers = DatasetFile::new("customers.csv", "customer_id,name\n7,Edsger\n");
    let second = target.migrate(vec![newcomers], schema).await;

    assert!(second.success, "{:?}", second.errors);
    assert_eq!(second.tables_created, vec!["customers"]);
    assert_eq!(second.rows_inserted.get("customers.csv"), Some(&1));
    assert_eq!(target.count("SELECT COUNT(*) FROM customers").await, 1);
    // undeclared tables are left alone, rows included
    assert_eq!(target.count("SELECT COUNT(*) FROM orders").await, 2);
}

#[tokio::test]
async fn test_running_twice_replaces_instead_of_appending() {
    let target = Target::new();
    let orders = DatasetFile::new("orders.csv", "order_id,customer_id,total\n10,1,9.5\n");

    let first = target
        .migrate(vec![customers(), orders.clone()], SHOP_SCHEMA)
        .await;
    let second = target.migrate(vec![customers(), orders], SHOP_SCHEMA).await;

    assert_eq!(first.rows_inserted, second.rows_inserted);
    assert_eq!(first.tables_created, second.tables_created);
    assert!(second.success, "{:?}", second.errors);
    assert_eq!(target.count("SELECT COUNT(*) FROM customers").await, 2);
    assert_eq!(target.count("SELECT COUNT(*) FROM orders").await, 1);
}

#[tokio::test]
async fn test_headers_are_matched_by_name_when_counts_differ() {
    let target = Target::new();
    let schema = "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, created_at TEXT);";
    let people = DatasetFile::new("people.csv", "Name,ID\nAda,1\nGrace,2\n");

    let report = target.migrate(vec![people], schema).await;

    assert!(report.success, "{:?}", report.errors);
    assert_eq!(
        target.scalar("SELECT name FROM people WHERE id = 2").await,
        Value::String("Grace".into())
    );
    assert_eq!(
        target
            .count("SELECT COUNT(*) FROM people WHERE created_at IS NULL")
            .await,
        2
    );
}

#[tokio::test]
async fn test_empty_and_na_cells_become_null() {
    let target = Target::new();
    let schema = "CREATE TABLE readings (id INTEGER PRIMARY KEY, reading REAL, note TEXT);";
    let readings = DatasetFile::new(
        "readings.csv",
        indoc! {"
            id,reading,note
            1,,ok
            2,NA,
            3,4.5,fine
        "},
    );

    let report = target.migrate(vec![readings], schema).await;

    assert!(report.success, "{:?}", report.errors);
    assert_eq!(
        target
            .count("SELECT COUNT(*) FROM readings WHERE reading IS NULL")
            .await,
        2
    );
    assert_eq!(
        target
            .count("SELECT COUNT(*) FROM readings WHERE note IS NULL")
            .await,
        1
    );
    assert_eq!(
        target.scalar("SELECT typeof(reading) FROM readings WHERE id = 3").await,
        Value::String("real".into())
    );
}

#[tokio::test]
async fn test_bad_rows_are_reported_and_skipped() {
    let target = Target::new();
    let schema = "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT NOT NULL);";
    let items = DatasetFile::new("items.csv", "id,label\n1,first\n2,\n3,third\n");

    let report = target.migrate(vec![items], schema).await;

    assert_eq!(report.rows_inserted.get("items.csv"), Some(&2));
    assert_eq!(report.errors.len(), 1);
    assert!(
        report.errors[0].starts_with("Row 2 of items.csv: "),
        "{}",
        report.errors[0]
    );
    assert_eq!(target.count("SELECT COUNT(*) FROM items").await, 2);
}

#[tokio::test]
async fn test_gateway_over_migrated_tables() {
    let target = Target::new();
    let orders = DatasetFile::new("orders.csv", "order_id,customer_id,total\n10,1,9.5\n");
    target.migrate(vec![customers(), orders], SHOP_SCHEMA).await;
    let gateway = QueryGateway::new(target.connect().await);

    let table = gateway
        .query("select name from customers order by customer_id")
        .await
        .unwrap();
    assert_eq!(table.columns, vec!["name"]);
    assert_eq!(
        table.rows,
        vec![
            vec![Value::String("Ada".into())],
            vec![Value::String("Grace".into())],
        ]
    );

    assert!(matches!(
        gateway.query("DROP TABLE customers").await,
        Err(GatewayError::PolicyViolation)
    ));

    let summary: Vec<(String, i64)> = gateway
        .list_tables()
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.name, t.row_count))
        .collect();
    assert_eq!(
        summary,
        vec![("customers".to_string(), 2), ("orders".to_string(), 1)]
    );

    let verification = gateway.verify_table("customers").await.unwrap();
    assert_eq!(verification.row_count, 2);
    assert_eq!(verification.sample.rows.len(), 2);
}

#![cfg(feature = "sqlite")]

/// Integration tests for the SQLite driver
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tablift_drivers::sqlite::SqliteDriver;
use tablift_drivers::{Connection, ConnectionConfig, DatabaseDriver, TabliftError, Value};
use tablift_core::ForeignKeyDefinition;

/// Open a connection to a fresh database file inside `dir`
async fn connect(dir: &tempfile::TempDir) -> Arc<dyn Connection> {
    let path = dir.path().join("test.db");
    SqliteDriver::new()
        .connect(&ConnectionConfig::new_sqlite(path.to_str().unwrap()))
        .await
        .expect("Failed to open test database")
}

async fn count(conn: &Arc<dyn Connection>, table: &str) -> i64 {
    conn.query(&format!("SELECT COUNT(*) FROM \"{}\"", table), &[])
        .await
        .unwrap()
        .scalar()
        .and_then(|v| v.as_i64())
        .unwrap()
}

fn customer_fk() -> ForeignKeyDefinition {
    ForeignKeyDefinition {
        name: Some("fk_orders_customer".into()),
        table: "orders".into(),
        columns: vec!["customer_id".into()],
        referenced_table: "customers".into(),
        referenced_columns: vec!["customer_id".into()],
    }
}

async fn setup_customers_and_orders(conn: &Arc<dyn Connection>) {
    for sql in [
        "CREATE TABLE customers (customer_id INTEGER PRIMARY KEY, name TEXT)",
        "CREATE TABLE orders (order_id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL)",
        "CREATE INDEX idx_orders_customer ON orders (customer_id)",
        "INSERT INTO customers VALUES (1, 'Ada'), (2, 'Grace')",
        "INSERT INTO orders VALUES (10, 1, 9.5), (11, 2, 20.0)",
    ] {
        conn.execute(sql, &[]).await.unwrap();
    }
}

#[tokio::test]
async fn test_add_foreign_key_rebuilds_table() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(&dir).await;
    setup_customers_and_orders(&conn).await;

    conn.add_foreign_key(&customer_fk()).await.unwrap();

    assert_eq!(count(&conn, "orders").await, 2);

    let fks = conn
        .query("SELECT \"table\", \"from\", \"to\" FROM pragma_foreign_key_list('orders')", &[])
        .await
        .unwrap();
    assert_eq!(fks.rows.len(), 1);
    assert_eq!(
        fks.rows[0].values,
        vec![
            Value::String("customers".into()),
            Value::String("customer_id".into()),
            Value::String("customer_id".into()),
        ]
    );

    let index = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_orders_customer'",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(index.scalar().and_then(|v| v.as_i64()), Some(1));

    // constraint is enforced from now on
    let err = conn
        .execute("INSERT INTO orders VALUES (12, 99, 1.0)", &[])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("FOREIGN KEY"), "{}", err);
}

#[tokio::test]
async fn test_add_foreign_key_with_orphans_keeps_rows_and_schema() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(&dir).await;
    setup_customers_and_orders(&conn).await;
    conn.execute("INSERT INTO orders VALUES (12, 404, 1.0)", &[])
        .await
        .unwrap();

    let err = conn.add_foreign_key(&customer_fk()).await.unwrap_err();
    assert!(matches!(err, TabliftError::Constraint(_)), "{:?}", err);

    assert_eq!(count(&conn, "orders").await, 3);
    let fks = conn
        .query("SELECT COUNT(*) FROM pragma_foreign_key_list('orders')", &[])
        .await
        .unwrap();
    assert_eq!(fks.scalar().and_then(|v| v.as_i64()), Some(0));
}

#[tokio::test]
async fn test_drop_table_cascade_inside_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(&dir).await;
    setup_customers_and_orders(&conn).await;
    conn.add_foreign_key(&customer_fk()).await.unwrap();

    // children first, as a reverse-declaration-order drop does
    let tx = conn.begin_transaction().await.unwrap();
    conn.drop_table_cascade("orders").await.unwrap();
    conn.drop_table_cascade("customers").await.unwrap();
    tx.commit().await.unwrap();

    let tables = conn
        .as_schema_introspection()
        .unwrap()
        .list_tables(None)
        .await
        .unwrap();
    assert!(tables.is_empty());
}

#[tokio::test]
async fn test_savepoints_keep_good_rows() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(&dir).await;
    conn.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, qty INTEGER NOT NULL)", &[])
        .await
        .unwrap();

    let tx = conn.begin_transaction().await.unwrap();
    let rows = [
        vec![Value::Int64(1), Value::Int64(5)],
        vec![Value::Int64(2), Value::Null],
        vec![Value::Int64(3), Value::Int64(7)],
    ];
    let mut failures = 0;
    for (i, params) in rows.iter().enumerate() {
        let name = format!("row_{}", i + 1);
        tx.savepoint(&name).await.unwrap();
        match tx.execute("INSERT INTO items (id, qty) VALUES (?, ?)", params).await {
            Ok(_) => tx.release_savepoint(&name).await.unwrap(),
            Err(_) => {
                failures += 1;
                tx.rollback_to_savepoint(&name).await.unwrap();
                tx.release_savepoint(&name).await.unwrap();
            }
        }
    }
    tx.commit().await.unwrap();

    assert_eq!(failures, 1);
    assert_eq!(count(&conn, "items").await, 2);
}

#[tokio::test]
async fn test_invalid_savepoint_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(&dir).await;
    let tx = conn.begin_transaction().await.unwrap();
    assert!(tx.savepoint("bad name; DROP TABLE x").await.is_err());
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_introspection_reports_columns_and_counts() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(&dir).await;
    setup_customers_and_orders(&conn).await;
    let schema = conn.as_schema_introspection().unwrap();

    let tables = schema.list_tables(None).await.unwrap();
    let summary: Vec<(String, Option<i64>)> = tables
        .iter()
        .map(|t| (t.name.clone(), t.row_count))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("customers".to_string(), Some(2)),
            ("orders".to_string(), Some(2)),
        ]
    );

    let columns = schema.get_columns(None, "orders").await.unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["order_id", "customer_id", "total"]);
    assert_eq!(columns[2].data_type, "REAL");
}

#[tokio::test]
async fn test_drop_transaction_ignores_leftover_children() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(&dir).await;
    setup_customers_and_orders(&conn).await;
    conn.add_foreign_key(&customer_fk()).await.unwrap();

    // orders still references customers and is not dropped
    let tx = conn.begin_drop_transaction().await.unwrap();
    conn.drop_table_cascade("customers").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(count(&conn, "orders").await, 2);
    let enforced = conn.query("PRAGMA foreign_keys", &[]).await.unwrap();
    assert_eq!(enforced.scalar().and_then(|v| v.as_i64()), Some(1));
}

#[tokio::test]
async fn test_plain_transaction_drop_of_referenced_table_fails_at_commit() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(&dir).await;
    setup_customers_and_orders(&conn).await;
    conn.add_foreign_key(&customer_fk()).await.unwrap();

    let tx = conn.begin_transaction().await.unwrap();
    conn.drop_table_cascade("customers").await.unwrap();
    assert!(tx.commit().await.is_err());

    assert_eq!(count(&conn, "customers").await, 2);
}

//! Adding foreign keys to existing SQLite tables.
//!
//! SQLite has no `ALTER TABLE .. ADD CONSTRAINT`, so the table is rebuilt:
//! a copy is created from the stored `CREATE TABLE` text with the constraint
//! appended, the rows are copied over, and the copy replaces the original.

use rusqlite::{Connection as RusqliteConnection, OptionalExtension};
use tablift_core::{ForeignKeyDefinition, Result, TabliftError, quote_identifier_ansi};

const REBUILD_SUFFIX: &str = "__tablift_rebuild";

pub(crate) fn add_foreign_key_by_rebuild(
    conn: &mut RusqliteConnection,
    fk: &ForeignKeyDefinition,
) -> Result<()> {
    if !conn.is_autocommit() {
        return Err(TabliftError::NotSupported(
            "SQLite cannot add a foreign key inside an open transaction".into(),
        ));
    }

    conn.pragma_update(None, "foreign_keys", "OFF")
        .map_err(|e| TabliftError::Query(format!("Failed to disable foreign keys: {}", e)))?;

    let result = rebuild_with_constraint(conn, fk);

    if let Err(e) = conn.pragma_update(None, "foreign_keys", "ON") {
        tracing::error!(error = %e, "failed to re-enable foreign keys after table rebuild");
    }

    result
}

fn rebuild_with_constraint(conn: &mut RusqliteConnection, fk: &ForeignKeyDefinition) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| TabliftError::Query(format!("Failed to begin transaction: {}", e)))?;

    let (table, create_sql): (String, String) = tx
        .query_row(
            "SELECT name, sql FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [&fk.table],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| TabliftError::Query(e.to_string()))?
        .ok_or_else(|| TabliftError::NotFound(format!("table '{}' does not exist", fk.table)))?;

    let dependents: Vec<String> = {
        let mut stmt = tx
            .prepare(
                "SELECT sql FROM sqlite_master \
                 WHERE type IN ('index', 'trigger') AND tbl_name = ?1 AND sql IS NOT NULL",
            )
            .map_err(|e| TabliftError::Query(e.to_string()))?;
        stmt.query_map([&table], |row| row.get(0))
            .map_err(|e| TabliftError::Query(e.to_string()))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| TabliftError::Query(e.to_string()))?
    };

    let temp_name = format!("{}{}", table, REBUILD_SUFFIX);
    let clause = fk.clause(quote_identifier_ansi);
    let rebuilt_sql = rewrite_create_sql(&create_sql, &quote_identifier_ansi(&temp_name), &clause)?;

    let quoted_table = quote_identifier_ansi(&table);
    let quoted_temp = quote_identifier_ansi(&temp_name);
    let steps = [
        rebuilt_sql,
        format!("INSERT INTO {} SELECT * FROM {}", quoted_temp, quoted_table),
        format!("DROP TABLE {}", quoted_table),
        format!("ALTER TABLE {} RENAME TO {}", quoted_temp, quoted_table),
    ];
    for sql in steps.iter().chain(dependents.iter()) {
        tx.execute_batch(sql).map_err(|e| {
            TabliftError::Query(format!("Failed to rebuild table {}: {}", table, e))
        })?;
    }

    let violations: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM pragma_foreign_key_check(?1)",
            [&table],
            |row| row.get(0),
        )
        .map_err(|e| TabliftError::Query(e.to_string()))?;

    if violations > 0 {
        // dropping `tx` rolls the rebuild back
        return Err(TabliftError::Constraint(format!(
            "foreign key violation: {} row(s) of {} reference missing rows in {}",
            violations, table, fk.referenced_table
        )));
    }

    tx.commit()
        .map_err(|e| TabliftError::Query(format!("Failed to commit table rebuild: {}", e)))?;
    Ok(())
}

/// Rewrite a stored `CREATE TABLE name (...) [options]` statement so that it
/// creates `new_name` with `clause` appended to the element list.
pub(crate) fn rewrite_create_sql(create_sql: &str, new_name: &str, clause: &str) -> Result<String> {
    let open = find_unquoted(create_sql, '(').ok_or_else(|| {
        TabliftError::NotSupported(format!(
            "cannot add a foreign key to a table without a column list: {}",
            create_sql
        ))
    })?;
    let close = create_sql.rfind(')').filter(|close| *close > open).ok_or_else(|| {
        TabliftError::Schema(format!("malformed CREATE TABLE statement: {}", create_sql))
    })?;

    let body = create_sql[open + 1..close].trim_end();
    let options = &create_sql[close + 1..];
    Ok(format!(
        "CREATE TABLE {} ({}, {}){}",
        new_name, body, clause, options
    ))
}

fn find_unquoted(text: &str, needle: char) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, ch) in text.char_indices() {
        match quote {
            Some(q) => {
                let closing = if q == '[' { ']' } else { q };
                if ch == closing {
                    quote = None;
                }
            }
            None if ch == '"' || ch == '\'' || ch == '`' || ch == '[' => quote = Some(ch),
            None if ch == needle => return Some(idx),
            None => {}
        }
    }
    None
}

//! Terminal output: comfy tables for people, JSON for scripts

use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;
use tablift_core::Value;
use tablift_migrate::{
    FileEntry, MigrationReport, PreparedRun, QueryTable, TableSummary, TableVerification,
    gateway::value_to_json,
};

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED).set_header(header.to_vec());
    table
}

fn cell(value: &Value) -> String {
    match value_to_json(value) {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

pub fn query_table(result: &QueryTable) -> Table {
    let header: Vec<&str> = result.columns.iter().map(String::as_str).collect();
    let mut table = table(&header);
    for row in &result.rows {
        table.add_row(row.iter().map(cell).collect::<Vec<_>>());
    }
    table
}

pub fn tables_table(tables: &[TableSummary]) -> Table {
    let mut table = table(&["Table", "Rows"]);
    for summary in tables {
        table.add_row(vec![summary.name.clone(), summary.row_count.to_string()]);
    }
    table
}

pub fn files_table(files: &[FileEntry]) -> Table {
    let mut table = table(&["File", "Size (bytes)"]);
    for file in files {
        table.add_row(vec![file.name.clone(), file.size_bytes.to_string()]);
    }
    table
}

pub fn render_verification(verification: &TableVerification) -> String {
    format!(
        "{}: {} rows\n{}",
        verification.table,
        verification.row_count,
        query_table(&verification.sample)
    )
}

pub fn render_report(report: &MigrationReport) -> String {
    let mut rows = table(&["File", "Rows inserted"]);
    for (file, count) in &report.rows_inserted {
        rows.add_row(vec![file.clone(), count.to_string()]);
    }

    let mut out = format!(
        "Tables created: {}\n{}\nForeign keys applied: {}\nFinished in {} ms\n",
        if report.tables_created.is_empty() {
            "(none)".to_string()
        } else {
            report.tables_created.join(", ")
        },
        rows,
        report.foreign_keys_applied,
        report.duration_ms
    );

    if report.success {
        out.push_str("Migration succeeded\n");
    } else {
        out.push_str(&format!("Migration finished with {} error(s):\n", report.errors.len()));
        for error in &report.errors {
            out.push_str(&format!("  - {}\n", error));
        }
    }
    out
}

pub fn render_prepared(prepared: &PreparedRun) -> String {
    let tables: Vec<&str> = prepared.tables.iter().map(|t| t.value.as_str()).collect();
    let mut out = format!(
        "-- tables: {}\n-- deferred foreign keys: {}\n",
        tables.join(", "),
        prepared.foreign_keys.len()
    );
    for step in prepared.steps.iter().filter(|step| !step.complete) {
        out.push_str(&format!(
            "-- warning: could not parse every foreign key in: {}\n",
            step.statement.text.lines().next().unwrap_or_default()
        ));
    }
    out.push('\n');
    out.push_str(&prepared.ddl);
    out
}

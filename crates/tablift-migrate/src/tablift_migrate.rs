//! tablift migrate - schema-driven table materialization and CSV loading
//!
//! A migration takes a set of CSV-shaped files plus untrusted DDL text and:
//!
//! 1. cleans and splits the DDL into statements (`ddl`)
//! 2. strips foreign keys out of CREATE TABLE bodies so they can be deferred
//! 3. drops and recreates the declared tables (`materializer`)
//! 4. loads every file into its table, reconciling headers against the
//!    table's real columns and coercing cells (`loader`, `reconcile`, `coerce`)
//! 5. applies the deferred foreign keys once all rows are in
//!
//! `MigrationRun` drives those phases. `QueryGateway` offers read-only access
//! to the result afterwards.

pub mod coerce;
pub mod ddl;
mod error;
pub mod gateway;
pub mod loader;
pub mod materializer;
pub mod naming;
pub mod oracle;
mod options;
pub mod reconcile;
mod run;
pub mod source;

#[cfg(test)]
mod test_helpers;

pub use coerce::{NullMarkers, TypeFamily, coerce_cell};
pub use ddl::{
    ForeignKeyConstraint, ForeignKeyExtraction, Identifier, Statement, StatementKind,
    clean_schema_text, extract_foreign_keys, split_statements,
};
pub use error::{GatewayError, MigrateError, OracleError, SourceError};
pub use gateway::{QueryGateway, QueryTable, TableSummary, TableVerification};
pub use loader::{LoadOutcome, RowLoader};
pub use materializer::{ConstraintOutcome, CreateOutcome, Materializer};
pub use naming::table_name_for_file;
pub use oracle::{SchemaFile, SchemaOracle, StaticSchema, build_inference_prompt};
pub use options::MigrateOptions;
pub use reconcile::{ColumnMapping, ColumnTarget, disambiguate_headers, reconcile_columns};
pub use run::{MigrationReport, MigrationRun, PreparedRun, SchemaStep, prepare_run};
pub use source::{DatasetFile, FileEntry, FileListingCache, FileSource, LocalDirectorySource};

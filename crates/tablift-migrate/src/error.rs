//! Migration errors
//!
//! Only conditions that make continuing meaningless become a `MigrateError`.
//! Everything recoverable is collected as a message on the report instead.

use tablift_core::TabliftError;
use thiserror::Error;

/// Run-aborting migration errors
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("No files to migrate")]
    NoFiles,

    #[error("Files {} all map to table '{table}'", files.join(", "))]
    TableNameConflict { table: String, files: Vec<String> },

    #[error("Failed to create table {table}: {message}")]
    SchemaCreation { table: String, message: String },

    #[error("Schema inference failed: {0}")]
    SchemaInference(#[from] OracleError),

    #[error("Phase '{phase}' timed out")]
    Timeout { phase: &'static str },

    #[error("Phase '{phase}' was cancelled")]
    Cancelled { phase: &'static str },

    #[error(transparent)]
    Database(#[from] TabliftError),
}

/// Query gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Only SELECT queries are allowed")]
    PolicyViolation,

    #[error(transparent)]
    Database(#[from] TabliftError),
}

/// File source errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File {0} is not valid UTF-8")]
    Encoding(String),
}

/// Schema oracle errors
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Oracle returned no schema")]
    Empty,

    #[error("{0}")]
    Other(String),
}

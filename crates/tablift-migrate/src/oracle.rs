//! Schema oracle seam
//!
//! Something has to propose DDL for the input files. In production this is a
//! language model; here the seam is a trait, and the shipped implementations
//! take DDL from the caller or from disk. Whatever an oracle returns is
//! treated as untrusted text and cleaned before use.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::ddl::clean_schema_text;
use crate::error::OracleError;
use crate::source::DatasetFile;

/// Proposes schema text for a set of files
#[async_trait]
pub trait SchemaOracle: Send + Sync {
    async fn infer_schema(&self, files: &[DatasetFile]) -> Result<String, OracleError>;
}

/// DDL supplied directly by the caller
#[derive(Debug, Clone)]
pub struct StaticSchema {
    ddl: String,
}

impl StaticSchema {
    pub fn new(ddl: impl Into<String>) -> Self {
        Self { ddl: ddl.into() }
    }
}

#[async_trait]
impl SchemaOracle for StaticSchema {
    async fn infer_schema(&self, _files: &[DatasetFile]) -> Result<String, OracleError> {
        non_empty(clean_schema_text(&self.ddl))
    }
}

/// DDL read from a file on every call
#[derive(Debug, Clone)]
pub struct SchemaFile {
    path: PathBuf,
}

impl SchemaFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SchemaOracle for SchemaFile {
    #[tracing::instrument(skip(self, _files), fields(path = %self.path.display()))]
    async fn infer_schema(&self, _files: &[DatasetFile]) -> Result<String, OracleError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        non_empty(clean_schema_text(&text))
    }
}

fn non_empty(ddl: String) -> Result<String, OracleError> {
    if ddl.is_empty() {
        Err(OracleError::Empty)
    } else {
        Ok(ddl)
    }
}

/// Render the schema-inference prompt for an external model.
///
/// Each file contributes its header plus at most `sample_rows` data lines.
pub fn build_inference_prompt(files: &[DatasetFile], sample_rows: usize) -> String {
    let sections = files
        .iter()
        .map(|file| {
            let sample = file
                .content
                .lines()
                .take(sample_rows + 1)
                .collect::<Vec<_>>()
                .join("\n");
            format!("=== {} ===\n{}", file.name, sample)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"You are a database architect. Analyze these CSV files and generate PostgreSQL DDL.

{sections}

Based on this data, generate:
1. CREATE TABLE statements with appropriate data types
2. Primary keys for each table
3. Foreign key constraints where relationships exist between tables
4. Do NOT add NOT NULL constraints except for primary key columns - the sample data may not show all possible null values

Requirements:
- CRITICAL: Copy column names EXACTLY as they appear in the CSV header row. Do NOT modify, rename, or correct column names in any way.
- Wrap ALL column names in double quotes to preserve exact names (e.g., "Code", "10/1 UCLA", "PHQ TOTAL ")
- Be CONSERVATIVE with types - if a column has ANY non-numeric values, use VARCHAR(255) or TEXT
- Only use INTEGER/DECIMAL if ALL values in the column are clearly numeric
- For money/prices, use DECIMAL(10,2)
- Use VARCHAR(255) as the default when uncertain
- Add foreign key constraints where you see obvious relationships
- Use the CSV filename (without extension) as the table name
- If there are duplicate column names, append a number like "Column 2", "Column 3" etc.

Output ONLY valid PostgreSQL DDL. No explanations, just SQL."#
    )
}

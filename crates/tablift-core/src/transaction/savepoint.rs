//! Savepoints within a transaction
//!
//! A savepoint is a named point inside a transaction that can be rolled back
//! to without aborting the whole transaction. The row loader wraps every
//! insert in one so that a single bad row does not poison the file's
//! transaction (PostgreSQL aborts the transaction on any error otherwise).
//!
//! # Example
//! ```ignore
//! let tx = conn.begin_transaction().await?;
//! tx.execute("INSERT INTO users VALUES (1, 'Alice')", &[]).await?;
//!
//! tx.savepoint("before_bob").await?;
//! if tx.execute("INSERT INTO users VALUES (1, 'Bob')", &[]).await.is_err() {
//!     tx.rollback_to_savepoint("before_bob").await?;
//! }
//! tx.release_savepoint("before_bob").await?;
//!
//! tx.commit().await?;
//! ```

use crate::{Result, TabliftError};

/// A savepoint within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    /// The name of the savepoint
    name: String,
}

impl Savepoint {
    /// Create a new savepoint handle with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Get the name of the savepoint.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Savepoint names are spliced into SQL, so only plain identifiers are allowed.
pub fn validate_savepoint_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(TabliftError::Query(format!(
            "Invalid savepoint name '{}'",
            name
        )))
    }
}

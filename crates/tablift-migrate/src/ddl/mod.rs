//! DDL analysis
//!
//! Schema text comes from an untrusted source (usually a language model), so
//! it is never handed to the database in one piece. It is cleaned, tokenized,
//! split into statements and stripped of foreign keys here, without any
//! database access.

mod foreign_key;
pub mod lexer;
mod statement;


pub use foreign_key::{ForeignKeyConstraint, ForeignKeyExtraction, extract_foreign_keys};
pub use statement::{
    Identifier, Statement, StatementKind, clean_schema_text, declared_tables, split_statements,
};

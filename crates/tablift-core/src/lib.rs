//! tablift core - shared abstractions for the tablift workspace
//!
//! This crate provides the traits and types that the drivers and the
//! migration engine agree on:
//!
//! - `DatabaseDriver` - Trait for database driver implementations
//! - `Connection` / `Transaction` - Async connection and transaction handles
//! - `SchemaIntrospection` - Table and column inspection
//! - Common types like `Value`, `Row`, `QueryResult`, `ForeignKeyDefinition`

mod connection;
mod driver;
mod error;
mod schema;
pub mod transaction;
mod types;

pub use connection::*;
pub use driver::*;
pub use error::*;
pub use schema::*;
pub use transaction::*;
pub use types::*;

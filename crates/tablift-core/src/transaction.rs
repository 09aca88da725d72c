//! Transaction-related types
//!
//! Savepoint operations themselves are default methods of the `Transaction`
//! trait in the connection module.

mod savepoint;

pub use savepoint::*;

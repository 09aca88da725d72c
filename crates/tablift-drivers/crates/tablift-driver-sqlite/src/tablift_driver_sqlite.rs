//! SQLite database driver implementation

mod connection;
mod driver;
mod foreign_key;

pub use connection::{SqliteConnection, SqliteTransaction};
pub use driver::SqliteDriver;

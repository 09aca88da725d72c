//! PostgreSQL driver implementation

mod connection;
mod driver;
mod schema;
mod tls;
mod value;

pub use connection::{PostgresCancelHandle, PostgresConnection, PostgresTransaction};
pub use driver::PostgresDriver;
pub use tls::{make_tls_connector, ssl_mode_from_str};

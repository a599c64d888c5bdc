//! Persistence layer: run records in libSQL.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlRunStore;
pub use traits::RunStore;

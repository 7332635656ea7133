//! Persistence layer: libSQL-backed storage for identities, tasks, and
//! the mailbox configuration.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;

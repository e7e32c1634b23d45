//! SQLite-backed persistence.

mod connection;
mod kv_storage;

pub use connection::DatabaseConnection;
pub use kv_storage::SqliteStorage;

//! The `Storage` port over a single SQLite key-value table.
//!
//! Keys are colon-namespaced strings (`log:entry:<orchestrationId>:<offset>`
//! and friends); values are opaque bytes. Prefix scans back log replay and
//! registry recovery.

use async_trait::async_trait;
use sqlx::Row;

use crate::adapters::sqlite::connection::DatabaseConnection;
use crate::domain::ports::storage::{Storage, StorageError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
)";

/// SQLite implementation of the engine's key-value storage.
pub struct SqliteStorage {
    connection: DatabaseConnection,
}

impl SqliteStorage {
    /// Open the database and bootstrap the schema.
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let connection = DatabaseConnection::open(path).await?;
        sqlx::query(SCHEMA).execute(connection.pool()).await?;
        Ok(Self { connection })
    }

    /// Escape `%`, `_`, and the escape character for a LIKE prefix scan.
    fn like_prefix(prefix: &str) -> String {
        let mut escaped = String::with_capacity(prefix.len() + 4);
        for ch in prefix.chars() {
            if matches!(ch, '%' | '_' | '\\') {
                escaped.push('\\');
            }
            escaped.push(ch);
        }
        escaped.push('%');
        escaped
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.connection.pool())
        .await
        .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(self.connection.pool())
            .await
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(self.connection.pool())
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let rows = sqlx::query(
            "SELECT key, value FROM kv_store WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )
        .bind(Self::like_prefix(prefix))
        .fetch_all(self.connection.pool())
        .await
        .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>(0), r.get::<Vec<u8>, _>(1)))
            .collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.connection.close().await;
        Ok(())
    }
}

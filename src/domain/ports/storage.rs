//! Storage port: a persistent key-value store.
//!
//! The core owns all semantics; storage only persists opaque values under
//! well-known key spaces (see the adapters for the SQLite implementation).

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage write failed: {0}")]
    WriteFailed(String),

    #[error("Storage read failed: {0}")]
    ReadFailed(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

/// Persistent key-value store the engine writes through.
///
/// Keys are flat strings namespaced by colon-separated prefixes
/// (`log:entry:<orchestrationId>:<offset>` and friends).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `value` under `key`, replacing any existing value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Read the value under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Delete `key`; deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, sorted by
    /// key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Flush and release resources. Further calls may fail.
    async fn close(&self) -> Result<(), StorageError>;
}

/// In-memory storage for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: tokio::sync::RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = InMemoryStorage::new();
        storage.put("a:1", b"one".to_vec()).await.unwrap();
        assert_eq!(storage.get("a:1").await.unwrap(), Some(b"one".to_vec()));
        storage.delete("a:1").await.unwrap();
        assert_eq!(storage.get("a:1").await.unwrap(), None);
        storage.delete("a:1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_prefix_sorted() {
        let storage = InMemoryStorage::new();
        storage.put("log:entry:o1:2", b"c".to_vec()).await.unwrap();
        storage.put("log:entry:o1:0", b"a".to_vec()).await.unwrap();
        storage.put("log:entry:o1:1", b"b".to_vec()).await.unwrap();
        storage.put("log:entry:o2:0", b"x".to_vec()).await.unwrap();

        let entries = storage.list_prefix("log:entry:o1:").await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, "log:entry:o1:0");
        assert_eq!(entries[2].0, "log:entry:o1:2");
    }
}

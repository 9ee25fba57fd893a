//! Volatile in-memory backend
//!
//! Last resort when no durable backend is usable. Nothing survives restart;
//! selection is logged at WARN by the driver probe.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::driver::{DriverKind, Result, StoreBackend};

/// In-memory storage driver
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StoreBackend for MemoryStore {
    fn kind(&self) -> DriverKind {
        DriverKind::Volatile
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryStore::new();

        store.write("mandara:k", "1").await.unwrap();
        assert_eq!(store.read("mandara:k").await.unwrap(), Some("1".to_string()));

        store.delete("mandara:k").await.unwrap();
        assert_eq!(store.read("mandara:k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_list_by_prefix() {
        let store = MemoryStore::new();

        store.write("mandara:a", "1").await.unwrap();
        store.write("other:b", "2").await.unwrap();

        let keys = store.list("mandara:").await.unwrap();
        assert_eq!(keys, vec!["mandara:a"]);
    }
}

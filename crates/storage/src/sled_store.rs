//! Structured on-device backend (sled)
//!
//! The preferred driver: an embedded ordered key-value database with
//! compression and background flushing.

use sled::Db;
use std::sync::Arc;

use crate::driver::{DriverKind, Result, StoreBackend, StoreConfig, StoreError};

/// Sled-backed storage driver
pub struct SledStore {
    db: Arc<Db>,
}

impl SledStore {
    /// Open (or create) the sled database under the configured data directory
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let db = sled::Config::new()
            .path(config.data_dir.join("offline.sled"))
            .cache_capacity(config.sled_cache_capacity)
            .use_compression(true)
            .flush_every_ms(Some(500))
            .open()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Open a temporary sled database (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait::async_trait]
impl StoreBackend for SledStore {
    fn kind(&self) -> DriverKind {
        DriverKind::Structured
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StoreError::Backend(format!("non-utf8 value at {}: {}", key, e)))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        self.db.insert(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                keys.push(key_str);
            }
        }
        Ok(keys)
    }
}

//! Flat-file backend
//!
//! Third in the fallback chain: the whole keyspace lives in one JSON document
//! wrapped in a checksum envelope, rewritten atomically (temp file + rename)
//! on every mutation. A corrupt or truncated file is reset to empty with a
//! logged warning instead of failing init; offline data loss is preferable to
//! a dead store on devices this driver targets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::driver::{DriverKind, Result, StoreBackend, StoreConfig};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    entries: HashMap<String, String>,
}

impl Envelope {
    fn new(entries: HashMap<String, String>) -> Result<Self> {
        let body = serde_json::to_string(&entries)?;
        let checksum = format!("{:x}", md5::compute(&body));
        Ok(Self { checksum, entries })
    }

    fn verify(&self) -> bool {
        match serde_json::to_string(&self.entries) {
            Ok(body) => format!("{:x}", md5::compute(&body)) == self.checksum,
            Err(_) => false,
        }
    }
}

/// Single-file storage driver
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) the store file under the configured data directory
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).await?;
        let path = config.data_dir.join("offline.json");

        let entries = match fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Envelope>(&contents) {
                Ok(envelope) if envelope.verify() => envelope.entries,
                _ => {
                    tracing::warn!(path = %path.display(), "store file corrupt; starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, entries: RwLock::new(entries) })
    }

    async fn persist(&self, entries: &HashMap<String, String>) -> Result<()> {
        let envelope = Envelope::new(entries.clone())?;
        let json = serde_json::to_string(&envelope)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreBackend for FileStore {
    fn kind(&self) -> DriverKind {
        DriverKind::FlatFile
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
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

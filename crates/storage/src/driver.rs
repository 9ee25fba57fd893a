//! Driver selection and the uniform key-value contract
//!
//! All persisted data flows through [`OfflineStore`]: a namespaced, async
//! key-value facade over one of four backends. Backend capability is probed
//! once during [`OfflineStore::init`], in priority order (sled, SQLite, flat
//! file, volatile map), and the selection is locked for the rest of the
//! session. Individual operation failures reject that call only; they never
//! force re-selection.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, OnceCell};

use crate::file_store::FileStore;
use crate::memory_store::MemoryStore;
use crate::sled_store::SledStore;
use crate::sqlite_store::SqliteStore;

/// Storage error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// Sled database error
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Store is unavailable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Which backend technology was selected at init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Structured on-device database (sled)
    Structured,

    /// Relational embedded database (SQLite)
    Relational,

    /// Flat checksummed JSON file
    FlatFile,

    /// Volatile in-memory map (last resort, nothing survives restart)
    Volatile,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Structured => write!(f, "structured"),
            DriverKind::Relational => write!(f, "relational"),
            DriverKind::FlatFile => write!(f, "flat-file"),
            DriverKind::Volatile => write!(f, "volatile"),
        }
    }
}

/// The backend contract every driver satisfies
///
/// Keys are fully namespaced strings; values are raw JSON text. Encoding,
/// namespacing, and the corrupt-value read fallback live in [`OfflineStore`].
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Which driver this is
    fn kind(&self) -> DriverKind;

    /// Read the raw value stored at `key`, or `None` if absent
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` at `key`, overwriting silently
    async fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`; no-op if absent
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the on-disk backends
    pub data_dir: PathBuf,
    /// Namespace prefix for every persisted key
    pub namespace: String,
    /// Sled cache capacity in bytes
    pub sled_cache_capacity: u64,
    /// SQLite connection pool size
    pub sqlite_max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("mandara-data"),
            namespace: "mandara".to_string(),
            sled_cache_capacity: 32 * 1024 * 1024, // 32MB
            sqlite_max_connections: 4,
        }
    }
}

impl StoreConfig {
    /// Create a configuration rooted at a custom data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), ..Default::default() }
    }

    /// Set the key namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set sled cache capacity in bytes
    pub fn sled_cache_capacity(mut self, bytes: u64) -> Self {
        self.sled_cache_capacity = bytes;
        self
    }

    /// Set the SQLite pool size
    pub fn sqlite_max_connections(mut self, max: u32) -> Self {
        self.sqlite_max_connections = max;
        self
    }
}

/// Namespaced key-value facade over the selected backend
///
/// Operations issued before [`init`](Self::init) resolves are not dropped:
/// they wait on the ready gate and complete once a backend is selected.
pub struct OfflineStore {
    config: StoreConfig,
    backend: OnceCell<Arc<dyn StoreBackend>>,
    ready_tx: watch::Sender<bool>,
}

impl OfflineStore {
    /// Create a store that has not yet selected a backend
    pub fn new(config: StoreConfig) -> Self {
        let (ready_tx, _ready_rx) = watch::channel(false);
        Self { config, backend: OnceCell::new(), ready_tx }
    }

    /// Create a store over a caller-supplied backend, ready immediately
    pub fn with_backend(config: StoreConfig, backend: Arc<dyn StoreBackend>) -> Self {
        let store = Self::new(config);
        // A fresh OnceCell cannot already be set.
        let _ = store.backend.set(backend);
        let _ = store.ready_tx.send(true);
        store
    }

    /// Create a volatile in-memory store (for testing and last-resort use)
    pub fn volatile() -> Self {
        Self::with_backend(StoreConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Probe backends in priority order and lock in the first usable one
    ///
    /// Never fails outright: when every durable backend is unavailable, the
    /// volatile in-memory map is selected with a logged warning. Calling
    /// `init` again is a no-op that returns the original selection.
    pub async fn init(&self) -> Result<DriverKind> {
        let config = self.config.clone();
        let backend = self
            .backend
            .get_or_init(|| async move { probe_backends(&config).await })
            .await;
        let kind = backend.kind();
        let _ = self.ready_tx.send(true);
        Ok(kind)
    }

    /// The selected driver, or `None` before init
    pub fn kind(&self) -> Option<DriverKind> {
        self.backend.get().map(|b| b.kind())
    }

    /// Whether a backend has been selected
    pub fn is_ready(&self) -> bool {
        self.backend.get().is_some()
    }

    /// The configured namespace
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Wait for the ready gate, then hand out the selected backend
    async fn backend(&self) -> Result<Arc<dyn StoreBackend>> {
        loop {
            if let Some(backend) = self.backend.get() {
                return Ok(Arc::clone(backend));
            }
            let mut rx = self.ready_tx.subscribe();
            // Re-check after subscribing so a racing init is not missed.
            if self.backend.get().is_none() && rx.changed().await.is_err() {
                return Err(StoreError::Unavailable("store dropped before init".to_string()));
            }
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.namespace, key)
    }

    fn ns_prefix(&self) -> String {
        format!("{}:", self.config.namespace)
    }

    /// Serialize `value` to JSON and write it at `key`
    pub async fn set_item<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let backend = self.backend().await?;
        let encoded = serde_json::to_string(value)?;
        backend.write(&self.full_key(key), &encoded).await
    }

    /// Read the value at `key`
    ///
    /// Returns `None` if absent. Stored text that is not valid JSON is
    /// returned as a JSON string rather than an error; reads never fail on a
    /// corrupt value.
    pub async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        let backend = self.backend().await?;
        match backend.read(&self.full_key(key)).await? {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(_) => Ok(Some(Value::String(raw))),
            },
            None => Ok(None),
        }
    }

    /// Read and deserialize the value at `key` into `T`
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let backend = self.backend().await?;
        match backend.read(&self.full_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove the value at `key`; no-op if absent
    pub async fn remove_item(&self, key: &str) -> Result<()> {
        let backend = self.backend().await?;
        backend.delete(&self.full_key(key)).await
    }

    /// Remove every key under this store's namespace
    ///
    /// Unrelated data sharing the same physical backend is untouched.
    pub async fn clear(&self) -> Result<()> {
        let backend = self.backend().await?;
        for key in backend.list(&self.ns_prefix()).await? {
            backend.delete(&key).await?;
        }
        Ok(())
    }

    /// List all owned keys, namespace stripped
    pub async fn keys(&self) -> Result<Vec<String>> {
        let backend = self.backend().await?;
        let prefix = self.ns_prefix();
        Ok(backend
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

/// Probe each backend in priority order, settling on the first usable one
async fn probe_backends(config: &StoreConfig) -> Arc<dyn StoreBackend> {
    match SledStore::open(config) {
        Ok(sled) => {
            let sled: Arc<dyn StoreBackend> = Arc::new(sled);
            if roundtrip_probe(config, sled.as_ref()).await {
                tracing::info!(driver = %sled.kind(), "storage driver selected");
                return sled;
            }
        }
        Err(e) => tracing::debug!("sled backend unavailable: {}", e),
    }

    match SqliteStore::open(config).await {
        Ok(sqlite) => {
            let sqlite: Arc<dyn StoreBackend> = Arc::new(sqlite);
            if roundtrip_probe(config, sqlite.as_ref()).await {
                tracing::info!(driver = %sqlite.kind(), "storage driver selected");
                return sqlite;
            }
        }
        Err(e) => tracing::debug!("sqlite backend unavailable: {}", e),
    }

    match FileStore::open(config).await {
        Ok(file) => {
            let file: Arc<dyn StoreBackend> = Arc::new(file);
            if roundtrip_probe(config, file.as_ref()).await {
                tracing::info!(driver = %file.kind(), "storage driver selected");
                return file;
            }
        }
        Err(e) => tracing::debug!("file backend unavailable: {}", e),
    }

    tracing::warn!(
        "no durable storage backend is usable; offline data will not survive restart"
    );
    Arc::new(MemoryStore::new())
}

/// Confirm a candidate backend actually accepts writes before locking it in
async fn roundtrip_probe(config: &StoreConfig, backend: &dyn StoreBackend) -> bool {
    let key = format!("{}:__probe", config.namespace);
    let wrote = backend.write(&key, "1").await.is_ok();
    let read = matches!(backend.read(&key).await, Ok(Some(ref v)) if v == "1");
    let cleaned = backend.delete(&key).await.is_ok();
    wrote && read && cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Snapshot {
        items: Vec<String>,
        total: u32,
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = OfflineStore::volatile();

        let snapshot = Snapshot { items: vec!["kayak-tour".to_string()], total: 15000 };
        store.set_item("cart", &snapshot).await.unwrap();

        let loaded: Snapshot = store.get_as("cart").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = OfflineStore::volatile();
        assert_eq!(store.get_item("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_is_silent() {
        let store = OfflineStore::volatile();

        store.set_item("k", &1).await.unwrap();
        store.set_item("k", &2).await.unwrap();

        let value: i32 = store.get_as("k").await.unwrap().unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_corrupt_value_read_falls_back_to_raw() {
        let backend = Arc::new(MemoryStore::new());
        let store = OfflineStore::with_backend(StoreConfig::default(), backend.clone());

        // Plant a value that is not valid JSON directly in the backend.
        backend.write("mandara:bad", "{not json").await.unwrap();

        let value = store.get_item("bad").await.unwrap().unwrap();
        assert_eq!(value, Value::String("{not json".to_string()));
    }

    #[tokio::test]
    async fn test_clear_touches_only_namespace() {
        let backend = Arc::new(MemoryStore::new());
        let store = OfflineStore::with_backend(StoreConfig::default(), backend.clone());

        store.set_item("mine", &"x").await.unwrap();
        backend.write("other_app:theirs", "\"y\"").await.unwrap();

        store.clear().await.unwrap();

        assert_eq!(store.get_item("mine").await.unwrap(), None);
        assert_eq!(
            backend.read("other_app:theirs").await.unwrap(),
            Some("\"y\"".to_string())
        );
    }

    #[tokio::test]
    async fn test_keys_are_namespace_stripped() {
        let store = OfflineStore::volatile();

        store.set_item("a", &1).await.unwrap();
        store.set_item("b", &2).await.unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let store = OfflineStore::volatile();
        store.remove_item("never-set").await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_wait_for_init() {
        let store = Arc::new(OfflineStore::new(StoreConfig::default()));

        let reader = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.get_item("pending").await })
        };

        // Give the reader a chance to park on the ready gate.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        let backend: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
        let _ = store.backend.set(backend);
        let _ = store.ready_tx.send(true);
        assert_eq!(store.kind(), Some(DriverKind::Volatile));

        let value = reader.await.unwrap().unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_init_selects_durable_backend_and_is_idempotent() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = OfflineStore::new(StoreConfig::new(temp.path()));

        let first = store.init().await.unwrap();
        assert_eq!(first, DriverKind::Structured);

        // Second init keeps the original selection.
        let second = store.init().await.unwrap();
        assert_eq!(second, first);

        store.set_item("probe", &true).await.unwrap();
        let value: bool = store.get_as("probe").await.unwrap().unwrap();
        assert!(value);
    }
}

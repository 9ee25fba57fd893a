//! Durable offline queue
//!
//! Buffers pending records per entity type through the storage driver. The
//! UI-facing side only appends; the synchronizer owns draining and marking.
//! Enqueue is synchronous so callers can reflect optimistic state at once;
//! the durable write happens in the background, and a failed write keeps the
//! record staged in memory where the next purge or drain cycle retries it.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::OfflineStore;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::record::{self, EntityType, PendingRecord};
use crate::status::OfflineEvent;
use crate::Result;

pub(crate) fn record_key(entity: EntityType, id: &str) -> String {
    format!("queue:{}:{}", entity.wire_name(), id)
}

fn type_prefix(entity: EntityType) -> String {
    format!("queue:{}:", entity.wire_name())
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long synced records are kept before garbage collection
    pub retention_window: Duration,
    /// Unsynced records older than this are dropped (accepted data loss)
    pub max_unsynced_age: Duration,
    /// How often the periodic purge runs
    pub purge_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retention_window: Duration::from_secs(7 * 24 * 3600),
            max_unsynced_age: Duration::from_secs(24 * 3600),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

impl QueueConfig {
    /// Set the synced-record retention window
    pub fn retention_window(mut self, window: Duration) -> Self {
        self.retention_window = window;
        self
    }

    /// Set the unsynced-record maximum age
    pub fn max_unsynced_age(mut self, age: Duration) -> Self {
        self.max_unsynced_age = age;
        self
    }

    /// Set the periodic purge interval
    pub fn purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }
}

/// Counters from one purge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Synced records garbage-collected past the retention window
    pub synced_removed: usize,
    /// Unsynced records dropped past the maximum age
    pub unsynced_dropped: usize,
}

/// Per-entity-type durable FIFO queue of pending records
pub struct OfflineQueue {
    store: Arc<OfflineStore>,
    config: QueueConfig,
    device_id: String,
    seq: Arc<AtomicU64>,
    unflushed: Arc<parking_lot::Mutex<Vec<PendingRecord>>>,
    maintenance: Arc<Mutex<()>>,
    events: broadcast::Sender<OfflineEvent>,
}

impl OfflineQueue {
    /// Open the queue over an initialized store
    ///
    /// Loads the device identity and seeds the sequence counter past any
    /// records left over from earlier sessions.
    pub async fn new(
        store: Arc<OfflineStore>,
        config: QueueConfig,
        events: broadcast::Sender<OfflineEvent>,
    ) -> Result<Self> {
        let device_id = record::device_identity(&store).await?;

        let queue = Self {
            store,
            config,
            device_id,
            seq: Arc::new(AtomicU64::new(0)),
            unflushed: Arc::new(parking_lot::Mutex::new(Vec::new())),
            maintenance: Arc::new(Mutex::new(())),
            events,
        };

        let mut max_seq = 0;
        for entity in EntityType::DRAIN_ORDER {
            for record in queue.load_type(entity).await? {
                max_seq = max_seq.max(record.seq + 1);
            }
        }
        queue.seq.store(max_seq, Ordering::SeqCst);

        Ok(queue)
    }

    /// The stable per-install device id
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// A clone of the lifecycle event sender
    pub fn events(&self) -> broadcast::Sender<OfflineEvent> {
        self.events.clone()
    }

    /// The mutex serializing purge against drain
    pub(crate) fn maintenance(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.maintenance)
    }

    /// Validate and append a record, returning it immediately
    ///
    /// The durable write runs in the background; until it lands the record
    /// lives in the staged buffer and is still visible to
    /// [`list_unsynced`](Self::list_unsynced). Must be called from within a
    /// tokio runtime.
    pub fn enqueue(&self, entity: EntityType, payload: serde_json::Value) -> Result<PendingRecord> {
        record::validate_payload(entity, &payload)?;

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let record = PendingRecord::new(entity, payload, seq, self.device_id.clone());

        self.unflushed.lock().push(record.clone());
        let _ = self.events.send(OfflineEvent::RecordEnqueued(record.clone()));

        let queue = self.clone();
        tokio::spawn(async move {
            let _ = queue.flush_staged().await;
        });

        Ok(record)
    }

    /// Retry durable writes for staged records; returns how many landed
    pub async fn flush_staged(&self) -> Result<usize> {
        let staged: Vec<PendingRecord> = self.unflushed.lock().clone();
        if staged.is_empty() {
            return Ok(0);
        }

        let mut flushed = Vec::new();
        for record in staged {
            let key = record_key(record.entity_type, &record.id);
            match self.store.set_item(&key, &record).await {
                Ok(()) => flushed.push(record.id.clone()),
                Err(e) => {
                    tracing::warn!(id = %record.id, "queue write failed, record stays staged: {}", e);
                }
            }
        }

        let count = flushed.len();
        self.unflushed.lock().retain(|r| !flushed.contains(&r.id));
        Ok(count)
    }

    /// All unsynced records of a type, oldest first
    pub async fn list_unsynced(&self, entity: EntityType) -> Result<Vec<PendingRecord>> {
        let mut records = self.load_type(entity).await?;
        records.retain(|r| !r.synced);

        let staged = self.unflushed.lock().clone();
        for record in staged {
            if record.entity_type == entity
                && !record.synced
                && !records.iter().any(|r| r.id == record.id)
            {
                records.push(record);
            }
        }

        records.sort_by_key(|r| (r.created_at, r.seq));
        Ok(records)
    }

    /// Flip `synced` for each id independently
    ///
    /// A failure updating one id never blocks the others; failed updates are
    /// logged and the record is retried on a later cycle.
    pub async fn mark_synced(&self, entity: EntityType, ids: &[String]) -> Result<()> {
        let now = Utc::now().timestamp_millis();

        for id in ids {
            let key = record_key(entity, id);
            match self.store.get_as::<PendingRecord>(&key).await {
                Ok(Some(mut record)) => {
                    record.synced = true;
                    record.synced_at = Some(now);
                    if let Err(e) = self.store.set_item(&key, &record).await {
                        tracing::warn!(id = %id, "failed to persist synced flag: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(id = %id, "failed to load record for marking: {}", e);
                }
            }

            // The durable write may not have landed yet; update the staged
            // copy too so the flag survives the flush.
            let mut staged = self.unflushed.lock();
            if let Some(record) = staged
                .iter_mut()
                .find(|r| r.entity_type == entity && &r.id == id)
            {
                record.synced = true;
                record.synced_at = Some(now);
            }
        }

        Ok(())
    }

    /// Explicitly remove a record, synced or not
    pub async fn cancel(&self, entity: EntityType, id: &str) -> Result<bool> {
        let staged_removed = {
            let mut staged = self.unflushed.lock();
            let before = staged.len();
            staged.retain(|r| !(r.entity_type == entity && r.id == id));
            staged.len() != before
        };

        let key = record_key(entity, id);
        let stored = self.store.get_item(&key).await?.is_some();
        if stored {
            self.store.remove_item(&key).await?;
        }

        Ok(staged_removed || stored)
    }

    /// Total unsynced records across all entity types
    pub async fn unsynced_count(&self) -> Result<usize> {
        let mut total = 0;
        for entity in EntityType::DRAIN_ORDER {
            total += self.list_unsynced(entity).await?.len();
        }
        Ok(total)
    }

    /// Drop expired records
    ///
    /// Synced records go after the retention window; unsynced records go
    /// strictly after the maximum age (age exactly at the limit is kept).
    /// Runs under the maintenance mutex so records mid-drain are never
    /// purged.
    pub async fn purge_expired(&self) -> Result<PurgeStats> {
        let maintenance = self.maintenance();
        let _guard = maintenance.lock().await;
        self.flush_staged().await?;
        self.purge_at(Utc::now().timestamp_millis()).await
    }

    async fn purge_at(&self, now: i64) -> Result<PurgeStats> {
        let retention = self.config.retention_window.as_millis() as i64;
        let max_age = self.config.max_unsynced_age.as_millis() as i64;
        let mut stats = PurgeStats::default();

        for entity in EntityType::DRAIN_ORDER {
            for key in self.keys_for(entity).await? {
                match self.store.get_as::<PendingRecord>(&key).await {
                    Ok(Some(record)) => {
                        if record.synced {
                            let synced_at = record.synced_at.unwrap_or(record.created_at);
                            if now - synced_at > retention {
                                self.store.remove_item(&key).await?;
                                stats.synced_removed += 1;
                            }
                        } else if now - record.created_at > max_age {
                            self.store.remove_item(&key).await?;
                            stats.unsynced_dropped += 1;
                            tracing::warn!(
                                id = %record.id,
                                entity = %entity,
                                age_ms = record.age_ms(now),
                                "dropping unsynced record past maximum age"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(storage::StoreError::Serialization(_)) => {
                        // Undecodable record: it can never sync, so it must
                        // not sit in the queue forever.
                        tracing::warn!(key = %key, "removing undecodable queue record");
                        self.store.remove_item(&key).await?;
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, "purge could not read record: {}", e);
                    }
                }
            }
        }

        if stats.synced_removed > 0 || stats.unsynced_dropped > 0 {
            tracing::info!(
                synced_removed = stats.synced_removed,
                unsynced_dropped = stats.unsynced_dropped,
                "purge pass complete"
            );
        }

        Ok(stats)
    }

    /// Start the periodic purge task
    pub fn spawn_purge(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(queue.config.purge_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = queue.purge_expired().await {
                    tracing::warn!("periodic purge failed: {}", e);
                }
            }
        })
    }

    async fn keys_for(&self, entity: EntityType) -> Result<Vec<String>> {
        let prefix = type_prefix(entity);
        Ok(self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(&prefix))
            .collect())
    }

    async fn load_type(&self, entity: EntityType) -> Result<Vec<PendingRecord>> {
        let mut records = Vec::new();
        for key in self.keys_for(entity).await? {
            match self.store.get_as::<PendingRecord>(&key).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, "skipping unreadable record: {}", e),
            }
        }
        Ok(records)
    }
}

impl Clone for OfflineQueue {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            device_id: self.device_id.clone(),
            seq: Arc::clone(&self.seq),
            unflushed: Arc::clone(&self.unflushed),
            maintenance: Arc::clone(&self.maintenance),
            events: self.events.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use storage::{DriverKind, MemoryStore, StoreBackend, StoreConfig};

    async fn test_queue() -> OfflineQueue {
        let store = Arc::new(OfflineStore::volatile());
        let (events, _rx) = broadcast::channel(16);
        OfflineQueue::new(store, QueueConfig::default(), events)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_returns_record_and_emits_event() {
        let queue = test_queue().await;
        let mut events = queue.events.subscribe();

        let record = queue
            .enqueue(EntityType::Cart, json!({"items": ["tour-1"]}))
            .unwrap();
        assert!(!record.synced);

        match events.try_recv().unwrap() {
            OfflineEvent::RecordEnqueued(enqueued) => assert_eq!(enqueued.id, record.id),
            other => panic!("unexpected event: {:?}", other),
        }

        queue.flush_staged().await.unwrap();
        let listed = queue.list_unsynced(EntityType::Cart).await.unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let queue = test_queue().await;

        let err = queue
            .enqueue(EntityType::Booking, json!({"seats": 2}))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
        assert_eq!(queue.unsynced_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_unsynced_is_fifo() {
        let queue = test_queue().await;

        let first = queue.enqueue(EntityType::Form, json!({"fields": {"n": 1}})).unwrap();
        let second = queue.enqueue(EntityType::Form, json!({"fields": {"n": 2}})).unwrap();
        let third = queue.enqueue(EntityType::Form, json!({"fields": {"n": 3}})).unwrap();
        queue.flush_staged().await.unwrap();

        let ids: Vec<String> = queue
            .list_unsynced(EntityType::Form)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn test_mark_synced_is_independent_per_id() {
        let queue = test_queue().await;

        let first = queue.enqueue(EntityType::Cart, json!({"items": [1]})).unwrap();
        let second = queue.enqueue(EntityType::Cart, json!({"items": [2]})).unwrap();
        queue.flush_staged().await.unwrap();

        // A bogus id among real ones must not block the rest.
        queue
            .mark_synced(
                EntityType::Cart,
                &["missing".to_string(), first.id.clone()],
            )
            .await
            .unwrap();

        let unsynced = queue.list_unsynced(EntityType::Cart).await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].id, second.id);

        let stored: PendingRecord = queue
            .store
            .get_as(&record_key(EntityType::Cart, &first.id))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.synced);
        assert!(stored.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_removes_record() {
        let queue = test_queue().await;

        let record = queue.enqueue(EntityType::Cart, json!({"items": []})).unwrap();
        queue.flush_staged().await.unwrap();

        assert!(queue.cancel(EntityType::Cart, &record.id).await.unwrap());
        assert!(!queue.cancel(EntityType::Cart, &record.id).await.unwrap());
        assert_eq!(queue.unsynced_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_boundary_is_strict() {
        let queue = test_queue().await;
        let max_age = queue.config.max_unsynced_age.as_millis() as i64;
        let now = Utc::now().timestamp_millis();

        let mut at_limit = PendingRecord::new(
            EntityType::Cart,
            json!({"items": []}),
            0,
            "d".to_string(),
        );
        at_limit.created_at = now - max_age;
        let mut past_limit = at_limit.clone();
        past_limit.id = "past".to_string();
        past_limit.created_at = now - max_age - 1;

        for record in [&at_limit, &past_limit] {
            queue
                .store
                .set_item(&record_key(EntityType::Cart, &record.id), record)
                .await
                .unwrap();
        }

        let stats = queue.purge_at(now).await.unwrap();
        assert_eq!(stats.unsynced_dropped, 1);

        let remaining = queue.list_unsynced(EntityType::Cart).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, at_limit.id);
    }

    #[tokio::test]
    async fn test_purge_respects_synced_retention() {
        let queue = test_queue().await;
        let retention = queue.config.retention_window.as_millis() as i64;
        let now = Utc::now().timestamp_millis();

        let mut fresh = PendingRecord::new(
            EntityType::Booking,
            json!({"excursion_id": 1}),
            0,
            "d".to_string(),
        );
        fresh.synced = true;
        fresh.synced_at = Some(now - retention);
        let mut expired = fresh.clone();
        expired.id = "old".to_string();
        expired.synced_at = Some(now - retention - 1);

        for record in [&fresh, &expired] {
            queue
                .store
                .set_item(&record_key(EntityType::Booking, &record.id), record)
                .await
                .unwrap();
        }

        let stats = queue.purge_at(now).await.unwrap();
        assert_eq!(stats.synced_removed, 1);
        assert_eq!(stats.unsynced_dropped, 0);

        assert!(queue
            .store
            .get_item(&record_key(EntityType::Booking, &fresh.id))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_purge_never_touches_fresh_unsynced_records() {
        let queue = test_queue().await;

        queue.enqueue(EntityType::Form, json!({"fields": {}})).unwrap();
        queue.flush_staged().await.unwrap();

        let stats = queue.purge_expired().await.unwrap();
        assert_eq!(stats, PurgeStats::default());
        assert_eq!(queue.unsynced_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_undecodable_records() {
        let queue = test_queue().await;

        queue
            .store
            .set_item(&record_key(EntityType::Cart, "garbled"), &json!({"id": 42}))
            .await
            .unwrap();

        queue.purge_expired().await.unwrap();
        assert!(queue
            .store
            .get_item(&record_key(EntityType::Cart, "garbled"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_purge_waits_for_maintenance_lock() {
        let queue = test_queue().await;

        let maintenance = queue.maintenance();
        let guard = maintenance.lock().await;

        let purger = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.purge_expired().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!purger.is_finished());

        drop(guard);
        purger.await.unwrap().unwrap();
    }

    /// Backend whose writes can be switched off, for staged-retry tests
    struct FlakyBackend {
        inner: MemoryStore,
        writes_fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StoreBackend for FlakyBackend {
        fn kind(&self) -> DriverKind {
            DriverKind::Volatile
        }

        async fn read(&self, key: &str) -> storage::Result<Option<String>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: &str) -> storage::Result<()> {
            if self.writes_fail.load(Ordering::SeqCst) {
                return Err(storage::StoreError::Backend("write refused".to_string()));
            }
            self.inner.write(key, value).await
        }

        async fn delete(&self, key: &str) -> storage::Result<()> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> storage::Result<Vec<String>> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_stays_staged_until_retried() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryStore::new(),
            writes_fail: AtomicBool::new(false),
        });
        let store = Arc::new(OfflineStore::with_backend(
            StoreConfig::default(),
            backend.clone(),
        ));
        let (events, _rx) = broadcast::channel(16);
        let queue = OfflineQueue::new(store, QueueConfig::default(), events)
            .await
            .unwrap();

        backend.writes_fail.store(true, Ordering::SeqCst);
        let record = queue.enqueue(EntityType::Cart, json!({"items": []})).unwrap();
        assert_eq!(queue.flush_staged().await.unwrap(), 0);

        // Still visible to the drain path even though the write failed.
        let listed = queue.list_unsynced(EntityType::Cart).await.unwrap();
        assert_eq!(listed[0].id, record.id);

        backend.writes_fail.store(false, Ordering::SeqCst);
        assert_eq!(queue.flush_staged().await.unwrap(), 1);
        assert!(queue.unflushed.lock().is_empty());

        let stored: PendingRecord = queue
            .store
            .get_as(&record_key(EntityType::Cart, &record.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, record.id);
    }

    #[tokio::test]
    async fn test_seq_resumes_past_existing_records() {
        let store = Arc::new(OfflineStore::volatile());
        let (events, _rx) = broadcast::channel(16);

        {
            let queue = OfflineQueue::new(Arc::clone(&store), QueueConfig::default(), events.clone())
                .await
                .unwrap();
            queue.enqueue(EntityType::Cart, json!({"items": []})).unwrap();
            queue.enqueue(EntityType::Cart, json!({"items": []})).unwrap();
            queue.flush_staged().await.unwrap();
        }

        let reopened = OfflineQueue::new(store, QueueConfig::default(), events)
            .await
            .unwrap();
        let record = reopened.enqueue(EntityType::Cart, json!({"items": []})).unwrap();
        assert_eq!(record.seq, 2);
    }
}

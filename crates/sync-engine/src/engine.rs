//! Drain cycles and engine wiring
//!
//! The [`Synchronizer`] owns the drain lifecycle: one cycle at a time, gated
//! on network quality, walking the entity types in strict dependency order
//! (carts before bookings before forms before loyalty). Retry counting is
//! per cycle: any batch success resets the counter, and exhausting it aborts
//! the remainder of the cycle and arms the backoff timer. Records the server
//! already acknowledged stay synced whatever happens afterwards.

use connectivity::{ConnectivityMonitor, MonitorConfig, QualityLevel};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{OfflineStore, StoreConfig};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backoff::RetryPolicy;
use crate::queue::{OfflineQueue, QueueConfig};
use crate::record::{self, EntityType, PendingRecord};
use crate::status::{OfflineEvent, StatusSnapshot, SyncStats, SyncStatus};
use crate::transport::{EndpointConfig, HttpTransport, SyncTransport};
use crate::Result;

/// Synchronizer configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Records per request, bounding payload size on thin links
    pub batch_size: usize,
    /// Consecutive failures before the cycle aborts
    pub max_retry_attempts: u32,
    /// Periodic backlog check
    pub tick_interval: Duration,
    /// Backoff policy between aborted cycles
    pub retry: RetryPolicy,
    /// Lifecycle event channel capacity
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retry_attempts: 3,
            tick_interval: Duration::from_secs(45),
            retry: RetryPolicy::default(),
            event_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Set the per-request batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set how many consecutive failures abort a cycle
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts.max(1);
        self
    }

    /// Set the periodic backlog check interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the backoff policy
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }
}

/// How a drain request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The cycle ran to the end of every queue
    Completed(SyncStats),
    /// The cycle stopped early (retries exhausted or connectivity lost)
    Aborted(SyncStats),
    /// Quality does not permit draining; nothing was sent
    Deferred(QualityLevel),
    /// An earlier aborted cycle's backoff delay has not elapsed yet
    BackedOff,
    /// Another drain is already running; this request folded into it
    Coalesced,
}

enum CycleEnd {
    Clean,
    RetriesExhausted,
    QualityLost,
}

/// Drains the offline queue to the remote endpoint
pub struct Synchronizer {
    queue: OfflineQueue,
    monitor: Arc<ConnectivityMonitor>,
    transport: Arc<dyn SyncTransport>,
    config: SyncConfig,
    drain_gate: Mutex<()>,
    cycle_attempt: AtomicU32,
    retry_after: parking_lot::Mutex<Option<Instant>>,
    status_tx: watch::Sender<StatusSnapshot>,
    events: broadcast::Sender<OfflineEvent>,
}

impl Synchronizer {
    /// Wire a synchronizer over an opened queue, monitor, and transport
    pub fn new(
        queue: OfflineQueue,
        monitor: Arc<ConnectivityMonitor>,
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
    ) -> Self {
        let events = queue.events();
        let (status_tx, _status_rx) = watch::channel(StatusSnapshot::default());

        Self {
            queue,
            monitor,
            transport,
            config,
            drain_gate: Mutex::new(()),
            cycle_attempt: AtomicU32::new(0),
            retry_after: parking_lot::Mutex::new(None),
            status_tx,
            events,
        }
    }

    /// Watch the status indicator and pending-count badge
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<OfflineEvent> {
        self.events.subscribe()
    }

    /// User-initiated drain; bypasses the backoff gate but not the quality
    /// gate or the single-flight guard
    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.drain(true).await
    }

    async fn pending(&self) -> usize {
        match self.queue.unsynced_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("could not count pending records: {}", e);
                self.status_tx.borrow().pending
            }
        }
    }

    /// Publish the status indicator; the badge always carries the live count
    async fn publish(&self, status: SyncStatus) -> usize {
        let pending = self.pending().await;
        let status = if pending == 0 && status == SyncStatus::ErrorWillRetry {
            SyncStatus::NonePending
        } else {
            status
        };
        self.status_tx.send_replace(StatusSnapshot { status, pending });
        pending
    }

    async fn drain(&self, bypass_backoff: bool) -> Result<DrainOutcome> {
        let Ok(_gate) = self.drain_gate.try_lock() else {
            tracing::debug!("drain already in progress; coalescing");
            return Ok(DrainOutcome::Coalesced);
        };

        if !bypass_backoff {
            let waiting = (*self.retry_after.lock()).is_some_and(|at| Instant::now() < at);
            if waiting {
                return Ok(DrainOutcome::BackedOff);
            }
        }

        let quality = self.monitor.quality().await;
        if !quality.usable() {
            self.publish(SyncStatus::ErrorWillRetry).await;
            tracing::debug!(%quality, "drain deferred until connection improves");
            return Ok(DrainOutcome::Deferred(quality));
        }

        let maintenance = self.queue.maintenance();
        let _maint = maintenance.lock().await;
        let started = std::time::Instant::now();
        let _ = self.queue.flush_staged().await;

        self.publish(SyncStatus::Syncing).await;
        let _ = self.events.send(OfflineEvent::SyncStarted);

        let mut stats = SyncStats::default();
        let mut failures: u32 = 0;
        let mut end = CycleEnd::Clean;

        'types: for entity in EntityType::DRAIN_ORDER {
            loop {
                // Connectivity can drop between batches; never send blind.
                if !self.monitor.quality().await.usable() {
                    end = CycleEnd::QualityLost;
                    break 'types;
                }

                let mut batch = self.queue.list_unsynced(entity).await?;
                batch.truncate(self.config.batch_size);
                if batch.is_empty() {
                    break;
                }

                let batch = self.discard_invalid(entity, batch).await;
                if batch.is_empty() {
                    continue;
                }

                match self
                    .transport
                    .push(entity, &batch, self.queue.device_id())
                    .await
                {
                    Ok(outcome) => {
                        failures = 0;
                        let acked = outcome.applied.len();
                        self.queue.mark_synced(entity, &outcome.applied).await?;
                        stats.pushed += acked;
                        self.publish(SyncStatus::Syncing).await;
                        tracing::debug!(%entity, acked, batch = batch.len(), "batch acknowledged");

                        if acked < batch.len() {
                            // Partial ack: the server deferred the rest.
                            // They stay queued for the next cycle instead of
                            // looping here.
                            break;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        stats.failed_batches += 1;
                        tracing::warn!(
                            %entity,
                            failures,
                            transient = e.is_transient(),
                            "batch send failed: {}",
                            e
                        );
                        if failures >= self.config.max_retry_attempts {
                            end = CycleEnd::RetriesExhausted;
                            break 'types;
                        }
                    }
                }
            }
        }

        stats.remaining = self.pending().await;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;

        match end {
            CycleEnd::Clean => {
                self.cycle_attempt.store(0, Ordering::SeqCst);
                *self.retry_after.lock() = None;
                if stats.remaining == 0 {
                    self.status_tx
                        .send_replace(StatusSnapshot { status: SyncStatus::Synced, pending: 0 });
                    let _ = self.events.send(OfflineEvent::SyncComplete(stats));
                    tracing::info!(
                        pushed = stats.pushed,
                        elapsed_ms = stats.elapsed_ms,
                        "sync cycle complete"
                    );
                } else {
                    // Partial acks left a backlog; the periodic trigger
                    // re-arms without restarting from carts.
                    self.publish(SyncStatus::ErrorWillRetry).await;
                }
                Ok(DrainOutcome::Completed(stats))
            }
            CycleEnd::RetriesExhausted => {
                let attempt = self.cycle_attempt.fetch_add(1, Ordering::SeqCst);
                let delay = self.config.retry.jittered(attempt);
                *self.retry_after.lock() = Some(Instant::now() + delay);
                self.publish(SyncStatus::ErrorWillRetry).await;
                tracing::error!(
                    delay_ms = delay.as_millis() as u64,
                    "drain cycle aborted after repeated failures; backing off"
                );
                Ok(DrainOutcome::Aborted(stats))
            }
            CycleEnd::QualityLost => {
                self.publish(SyncStatus::ErrorWillRetry).await;
                tracing::debug!("connectivity lost mid-cycle; drain suspended");
                Ok(DrainOutcome::Aborted(stats))
            }
        }
    }

    /// Drop stored records whose payload no longer validates; stale garbage
    /// must not retry forever
    async fn discard_invalid(
        &self,
        entity: EntityType,
        batch: Vec<PendingRecord>,
    ) -> Vec<PendingRecord> {
        let mut valid = Vec::with_capacity(batch.len());
        for record in batch {
            match record::validate_payload(entity, &record.payload) {
                Ok(()) => valid.push(record),
                Err(e) => {
                    tracing::warn!(id = %record.id, "dropping record invalid at send time: {}", e);
                    let _ = self.queue.cancel(entity, &record.id).await;
                }
            }
        }
        valid
    }

    /// Start the trigger loop: periodic backlog ticks, quality transitions,
    /// and scheduled backoff retries
    pub fn spawn(sync: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut quality_rx = sync.monitor.subscribe();
            let mut tick = tokio::time::interval(sync.config.tick_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let retry_at = *sync.retry_after.lock();
                tokio::select! {
                    _ = tick.tick() => {
                        if sync.pending().await > 0 {
                            let _ = sync.drain(false).await;
                        }
                    }
                    result = quality_rx.recv() => match result {
                        Ok(level) => {
                            let _ = sync.events.send(OfflineEvent::NetworkChanged(level));
                            if level.usable() {
                                let pending = sync.pending().await;
                                if pending > 0 {
                                    let _ = sync.events.send(OfflineEvent::SyncRequired { pending });
                                    let _ = sync.drain(false).await;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = sleep_until_or_never(retry_at) => {
                        let _ = sync.drain(true).await;
                    }
                }
            }
        })
    }
}

async fn sleep_until_or_never(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Aggregate configuration for [`OfflineEngine::start`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Storage layer configuration
    pub store: StoreConfig,
    /// Quality monitor configuration
    pub monitor: MonitorConfig,
    /// Queue retention configuration
    pub queue: QueueConfig,
    /// Synchronizer configuration
    pub sync: SyncConfig,
    /// Remote endpoint configuration
    pub endpoint: EndpointConfig,
}

impl EngineConfig {
    /// Default everything except the endpoint, which has no safe default
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            store: StoreConfig::default(),
            monitor: MonitorConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
            endpoint,
        }
    }

    /// Override the storage configuration
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Override the monitor configuration
    pub fn monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Override the queue configuration
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Override the synchronizer configuration
    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}

/// The assembled offline engine: storage, monitor, queue, synchronizer, and
/// their background tasks
pub struct OfflineEngine {
    store: Arc<OfflineStore>,
    monitor: Arc<ConnectivityMonitor>,
    queue: OfflineQueue,
    synchronizer: Arc<Synchronizer>,
    tasks: Vec<JoinHandle<()>>,
}

impl OfflineEngine {
    /// Initialize storage, run the startup purge, and start the background
    /// tasks (probe loop, periodic purge, drain triggers)
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let store = Arc::new(OfflineStore::new(config.store));
        let driver = store.init().await?;
        tracing::info!(%driver, "offline engine starting");

        let monitor = Arc::new(ConnectivityMonitor::new(config.monitor)?);
        let (events, _events_rx) = broadcast::channel(config.sync.event_capacity);
        let queue = OfflineQueue::new(Arc::clone(&store), config.queue, events).await?;
        queue.purge_expired().await?;

        let transport: Arc<dyn SyncTransport> = Arc::new(HttpTransport::new(config.endpoint)?);
        let synchronizer = Arc::new(Synchronizer::new(
            queue.clone(),
            Arc::clone(&monitor),
            transport,
            config.sync,
        ));

        let tasks = vec![
            ConnectivityMonitor::spawn(Arc::clone(&monitor)),
            queue.spawn_purge(),
            Synchronizer::spawn(Arc::clone(&synchronizer)),
        ];

        Ok(Self { store, monitor, queue, synchronizer, tasks })
    }

    /// Buffer a user action for eventual sync
    pub fn enqueue(&self, entity: EntityType, payload: serde_json::Value) -> Result<PendingRecord> {
        self.queue.enqueue(entity, payload)
    }

    /// User-initiated "sync now"
    pub async fn sync_now(&self) -> Result<DrainOutcome> {
        self.synchronizer.sync_now().await
    }

    /// Current unsynced total
    pub async fn pending(&self) -> Result<usize> {
        self.queue.unsynced_count().await
    }

    /// Watch the status indicator
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.synchronizer.status()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<OfflineEvent> {
        self.synchronizer.subscribe()
    }

    /// The quality monitor, for feeding host link signals and hints
    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// The underlying store, shared with features like form autosave
    pub fn store(&self) -> &Arc<OfflineStore> {
        &self.store
    }

    /// The stable per-install device id
    pub fn device_id(&self) -> &str {
        self.queue.device_id()
    }

    /// Stop the background tasks and release the storage backend; buffered
    /// data stays on disk
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

//! Status surface and lifecycle events
//!
//! Everything here is plain data: the UI layer only ever observes the
//! pending count, the status enum, and these event payloads.

use connectivity::QualityLevel;
use serde::{Deserialize, Serialize};

use crate::record::PendingRecord;

/// User-visible synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing waiting to sync
    NonePending,
    /// A drain cycle is running
    Syncing,
    /// Records are pending; a retry is scheduled or awaited
    ErrorWillRetry,
    /// The last cycle drained everything
    Synced,
}

/// Status indicator plus the unsynced-count badge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Current status
    pub status: SyncStatus,
    /// Total unsynced records across all entity types
    pub pending: usize,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self { status: SyncStatus::NonePending, pending: 0 }
    }
}

/// Outcome counters for one drain cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Records acknowledged by the server this cycle
    pub pushed: usize,
    /// Transport failures counted against the cycle
    pub failed_batches: u32,
    /// Unsynced records left when the cycle ended
    pub remaining: usize,
    /// Wall-clock duration of the cycle in ms
    pub elapsed_ms: u64,
}

/// Lifecycle notifications broadcast to the UI and other features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OfflineEvent {
    /// The quality monitor confirmed a level change
    NetworkChanged(QualityLevel),
    /// A record was appended to a queue
    RecordEnqueued(PendingRecord),
    /// Usable connectivity returned while a backlog exists
    SyncRequired {
        /// Unsynced records waiting
        pending: usize,
    },
    /// A drain cycle started
    SyncStarted,
    /// A drain cycle finished with every queue empty
    SyncComplete(SyncStats),
}

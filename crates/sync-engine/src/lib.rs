//! Offline synchronization engine for Mandara Offline
//!
//! Durably buffers mutating user actions (cart snapshots, bookings, form
//! submissions, loyalty transactions) while the connection cannot be trusted,
//! then drains them to the remote endpoint in strict dependency order once
//! the quality monitor allows it — with per-cycle retry counting, capped
//! exponential backoff with jitter, partial-batch acknowledgement, and a
//! user-visible status surface.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod engine;
pub mod queue;
pub mod record;
pub mod status;
pub mod transport;

pub use backoff::RetryPolicy;
pub use engine::{DrainOutcome, EngineConfig, OfflineEngine, SyncConfig, Synchronizer};
pub use queue::{OfflineQueue, PurgeStats, QueueConfig};
pub use record::{EntityType, PendingRecord};
pub use status::{OfflineEvent, StatusSnapshot, SyncStats, SyncStatus};
pub use transport::{EndpointConfig, HttpTransport, PushOutcome, SyncTransport, TransportError};

use thiserror::Error;

/// Sync engine error types
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage layer failure
    #[error("Storage error: {0}")]
    Store(#[from] storage::StoreError),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload rejected before a record was created
    #[error("Invalid {entity} payload: {reason}")]
    Validation {
        /// Entity type the payload was meant for
        entity: EntityType,
        /// What was wrong with it
        reason: String,
    },

    /// Monitor construction failure
    #[error("Monitor error: {0}")]
    Monitor(#[from] connectivity::MonitorError),
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

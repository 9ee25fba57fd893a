//! Pending records and payload validation

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use storage::OfflineStore;
use uuid::Uuid;

use crate::{Result, SyncError};

/// Storage key holding the stable per-install device identifier
const DEVICE_ID_KEY: &str = "device_id";

/// A category of locally buffered user action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Abandoned-cart snapshot
    Cart,
    /// Excursion booking
    Booking,
    /// Contact/feedback form submission
    Form,
    /// Loyalty points earn/spend
    LoyaltyTransaction,
}

impl EntityType {
    /// Strict drain order: later types may reference earlier ones (a booking
    /// references a cart, a loyalty transaction references a booking)
    pub const DRAIN_ORDER: [EntityType; 4] = [
        EntityType::Cart,
        EntityType::Booking,
        EntityType::Form,
        EntityType::LoyaltyTransaction,
    ];

    /// Name used on the wire and in storage keys
    pub fn wire_name(&self) -> &'static str {
        match self {
            EntityType::Cart => "cart",
            EntityType::Booking => "booking",
            EntityType::Form => "form",
            EntityType::LoyaltyTransaction => "loyalty_transaction",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

/// A unit of locally buffered work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingRecord {
    /// Client-generated id, unique per record
    pub id: String,
    /// Idempotency key sent with every delivery attempt of this record.
    /// Generated once at creation and reused verbatim across retries, so the
    /// server can treat a re-delivered attempt as already applied.
    pub request_id: String,
    /// Which queue this record belongs to
    pub entity_type: EntityType,
    /// Entity-specific data, opaque to the engine
    pub payload: Value,
    /// Creation time, ms since epoch; never mutated
    pub created_at: i64,
    /// Session-monotonic tiebreaker for records sharing a millisecond
    pub seq: u64,
    /// False until the server acknowledges this record
    pub synced: bool,
    /// Acknowledgement time, ms since epoch
    pub synced_at: Option<i64>,
    /// Stable per-install identifier, for server-side dedup
    pub device_id: String,
}

impl PendingRecord {
    pub(crate) fn new(
        entity_type: EntityType,
        payload: Value,
        seq: u64,
        device_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request_id: Uuid::new_v4().to_string(),
            entity_type,
            payload,
            created_at: Utc::now().timestamp_millis(),
            seq,
            synced: false,
            synced_at: None,
            device_id,
        }
    }

    /// Age in milliseconds relative to `now`
    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.created_at
    }
}

/// Reject a payload before a record is ever created
///
/// A payload must be a JSON object carrying the fields the server requires
/// for its entity type; anything else would retry forever downstream.
pub fn validate_payload(entity: EntityType, payload: &Value) -> Result<()> {
    let object = payload.as_object().ok_or_else(|| SyncError::Validation {
        entity,
        reason: "payload must be a JSON object".to_string(),
    })?;

    let required: &[&str] = match entity {
        EntityType::Cart => &["items"],
        EntityType::Booking => &["excursion_id"],
        EntityType::Form => &["fields"],
        EntityType::LoyaltyTransaction => &["points", "operation"],
    };

    for field in required {
        if !object.contains_key(*field) {
            return Err(SyncError::Validation {
                entity,
                reason: format!("missing required field `{}`", field),
            });
        }
    }

    Ok(())
}

/// Load the stable per-install device id, generating and persisting it on
/// first run
pub async fn device_identity(store: &OfflineStore) -> Result<String> {
    if let Some(existing) = store.get_as::<String>(DEVICE_ID_KEY).await? {
        return Ok(existing);
    }

    let fresh = Uuid::new_v4().to_string();
    store.set_item(DEVICE_ID_KEY, &fresh).await?;
    tracing::info!(device_id = %fresh, "generated device identity");
    Ok(fresh)
}

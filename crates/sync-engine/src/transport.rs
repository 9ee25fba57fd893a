//! Remote sync endpoint transport
//!
//! The server contract is one POST endpoint taking form-encoded fields: a
//! fixed `action` discriminator, a security token, the entity `data_type`,
//! the `device_id`, and a JSON-encoded `data` batch. It answers with a
//! `success` flag and the list of record ids it considers applied, which may
//! be a strict subset of the batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use crate::record::{EntityType, PendingRecord};

/// Transport error types
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level failure (reset, timeout, DNS)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-success HTTP status
    #[error("Endpoint returned status {status}")]
    Status {
        /// The HTTP status code
        status: u16,
    },

    /// Endpoint answered `success: false`
    #[error("Endpoint rejected batch: {message}")]
    Rejected {
        /// Server-provided error message
        message: String,
    },

    /// Failed to encode the outgoing batch
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the failure is worth retrying under the backoff policy
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(_) => true,
            TransportError::Status { status } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            TransportError::Rejected { .. } | TransportError::Encode(_) => false,
        }
    }
}

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Sync endpoint URL
    pub base_url: String,
    /// Fixed action discriminator the server routes on
    pub action: String,
    /// Security token issued by the server
    pub token: String,
    /// Per-request deadline
    pub timeout: Duration,
}

impl EndpointConfig {
    /// Create a configuration for the given endpoint and token
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            action: "mandara_offline_sync".to_string(),
            token: token.into(),
            timeout: Duration::from_secs(20),
        }
    }

    /// Override the action discriminator
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    /// Override the request deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One record as the server sees it
#[derive(Debug, Serialize)]
struct WireRecord<'a> {
    id: &'a str,
    request_id: &'a str,
    payload: &'a Value,
    created_at: i64,
}

impl<'a> From<&'a PendingRecord> for WireRecord<'a> {
    fn from(record: &'a PendingRecord) -> Self {
        Self {
            id: &record.id,
            request_id: &record.request_id,
            payload: &record.payload,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    success: bool,
    #[serde(default)]
    applied: Vec<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Server acknowledgement for one pushed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Record ids the server considers applied; may be a subset of the batch
    pub applied: Vec<String>,
}

/// Seam between the synchronizer and the remote endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Submit one batch of records of a single entity type
    async fn push(
        &self,
        entity: EntityType,
        batch: &[PendingRecord],
        device_id: &str,
    ) -> std::result::Result<PushOutcome, TransportError>;
}

/// reqwest implementation of the endpoint contract
pub struct HttpTransport {
    config: EndpointConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build the transport; fails only if the HTTP client cannot be built
    pub fn new(config: EndpointConfig) -> std::result::Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(
        &self,
        entity: EntityType,
        batch: &[PendingRecord],
        device_id: &str,
    ) -> std::result::Result<PushOutcome, TransportError> {
        let wire: Vec<WireRecord<'_>> = batch.iter().map(WireRecord::from).collect();
        let data = serde_json::to_string(&wire)?;

        let response = self
            .client
            .post(&self.config.base_url)
            .form(&[
                ("action", self.config.action.as_str()),
                ("token", self.config.token.as_str()),
                ("data_type", entity.wire_name()),
                ("device_id", device_id),
                ("data", data.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status { status: status.as_u16() });
        }

        let body: PushResponse = response.json().await?;
        if !body.success {
            return Err(TransportError::Rejected {
                message: body.message.unwrap_or_else(|| "unspecified".to_string()),
            });
        }

        Ok(PushOutcome { applied: body.applied })
    }
}

//! Run status events.
//!
//! Events are encrypted before they leave the process. Each run has its own
//! channel, and the latest event is also stored under an expiring key so a
//! subscriber that connects late can catch up.

use crate::crypto::Cipher;
use crate::error::{Result, ShellQueryError};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Pipeline checkpoint or terminal outcome reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Queued,
    ValidatingQuery,
    CreatingDataExtension,
    TargetingDataExtension,
    ExecutingQuery,
    FetchingResults,
    Ready,
    Failed,
    Canceled,
}

impl StatusKind {
    /// Human-readable message sent with the status.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Queued => "Queued...",
            Self::ValidatingQuery => "Validating query...",
            Self::CreatingDataExtension => "Creating temporary data extension...",
            Self::TargetingDataExtension => "Preparing target data extension...",
            Self::ExecutingQuery => "Executing query...",
            Self::FetchingResults => "Fetching results...",
            Self::Ready => "Query completed",
            Self::Failed => "Query failed",
            Self::Canceled => "Query canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Canceled)
    }
}

/// Event published to a run's channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: StatusKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub run_id: String,
}

impl StatusEvent {
    pub fn new(run_id: impl Into<String>, status: StatusKind, error_message: Option<String>) -> Self {
        Self {
            status,
            message: status.message().to_string(),
            error_message,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            run_id: run_id.into(),
        }
    }
}

/// Channel carrying a run's events.
pub fn channel_for(run_id: &str) -> String {
    format!("run-status:{run_id}")
}

/// Key holding a run's latest event.
pub fn latest_key_for(run_id: &str) -> String {
    format!("run-status:last:{run_id}")
}

/// Pub/sub transport plus an expiring key-value cache.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Reads a cached value, `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Receives status updates at pipeline checkpoints.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(
        &self,
        run_id: &str,
        status: StatusKind,
        error_message: Option<&str>,
    ) -> Result<()>;
}

/// Publishes encrypted events to an [`EventBus`].
#[derive(Clone)]
pub struct EncryptedStatusPublisher {
    bus: Arc<dyn EventBus>,
    cipher: Arc<dyn Cipher>,
    latest_ttl: Duration,
}

impl EncryptedStatusPublisher {
    pub fn new(bus: Arc<dyn EventBus>, cipher: Arc<dyn Cipher>, latest_ttl: Duration) -> Self {
        Self {
            bus,
            cipher,
            latest_ttl,
        }
    }

    /// Reads and decrypts a run's latest event.
    pub async fn latest(&self, run_id: &str) -> Result<Option<StatusEvent>> {
        let Some(sealed) = self.bus.get(&latest_key_for(run_id)).await? else {
            return Ok(None);
        };
        let Some(json) = self.cipher.decrypt(&sealed)? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| ShellQueryError::internal(format!("Malformed status event: {e}")))
    }
}

#[async_trait]
impl StatusPublisher for EncryptedStatusPublisher {
    async fn publish(
        &self,
        run_id: &str,
        status: StatusKind,
        error_message: Option<&str>,
    ) -> Result<()> {
        let event = StatusEvent::new(run_id, status, error_message.map(str::to_string));
        let json = serde_json::to_string(&event)
            .map_err(|e| ShellQueryError::internal(format!("Failed to serialize event: {e}")))?;
        let sealed = self.cipher.encrypt(&json)?;

        self.bus.publish(&channel_for(run_id), &sealed).await?;
        if status.is_terminal() {
            self.bus
                .set_with_ttl(&latest_key_for(run_id), &sealed, self.latest_ttl)
                .await?;
        }
        debug!(run_id, status = ?status, "Published status event");
        Ok(())
    }
}

/// A publisher bound to one run, handed to the execution strategies.
#[derive(Clone, Copy)]
pub struct StatusReporter<'a> {
    publisher: &'a dyn StatusPublisher,
    run_id: &'a str,
}

impl<'a> StatusReporter<'a> {
    pub fn new(publisher: &'a dyn StatusPublisher, run_id: &'a str) -> Self {
        Self { publisher, run_id }
    }

    /// Publishes a checkpoint. Failures are logged, never propagated: a lost
    /// progress message must not fail the run.
    pub async fn checkpoint(&self, status: StatusKind) {
        if let Err(e) = self.publisher.publish(self.run_id, status, None).await {
            warn!(run_id = self.run_id, "Failed to publish {:?}: {e}", status);
        }
    }
}

//! Run records: the source of truth for a query's lifecycle.
//!
//! A run is created on submission and mutated only by the job processor (and
//! by cancellation, which lives outside the pipeline). Status only moves
//! forward: queued → running → {ready, failed, canceled}.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Ready,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Canceled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Ready | Self::Failed | Self::Canceled => 2,
        }
    }

    /// Returns true if a run in this status may move to `next`.
    ///
    /// Terminal statuses are final; re-entering the current non-terminal
    /// status is allowed so that redelivered jobs stay idempotent.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted query run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub mid: String,
    pub status: RunStatus,
    pub task_id: Option<String>,
    pub query_definition_id: Option<String>,
    pub error_message: Option<String>,
    /// SHA-256 of the plaintext SQL, hex-encoded.
    pub sql_text_hash: String,
    pub target_destination_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Creates a queued run.
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        mid: impl Into<String>,
        sql_text_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            mid: mid.into(),
            status: RunStatus::Queued,
            task_id: None,
            query_definition_id: None,
            error_message: None,
            sql_text_hash: sql_text_hash.into(),
            target_destination_key: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_target(mut self, key: impl Into<String>) -> Self {
        self.target_destination_key = Some(key.into());
        self
    }
}

/// Storage for run records.
///
/// Every `mark_*` method applies the transition only when the current status
/// allows it and returns whether it did.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Records the dispatched task and moves the run to running.
    async fn mark_running(
        &self,
        run_id: &str,
        task_id: &str,
        query_definition_id: &str,
    ) -> Result<bool>;

    async fn mark_ready(&self, run_id: &str) -> Result<bool>;

    async fn mark_failed(&self, run_id: &str, error_message: &str) -> Result<bool>;

    async fn mark_canceled(&self, run_id: &str) -> Result<bool>;
}

/// Hashes SQL text for the run record.
pub fn sql_text_hash(sql: &str) -> String {
    format!("{:x}", Sha256::digest(sql.as_bytes()))
}

/// Generates a random run id.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_monotonic() {
        use RunStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Canceled));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Ready));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Canceled.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Ready,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_sql_text_hash() {
        assert_eq!(
            sql_text_hash("SELECT 1"),
            "e004ebd5b5532a4b85984a62f8ad48a81aa3460c1ca07701f386135d72cdecf5"
        );
    }

    #[test]
    fn test_run_id_layout() {
        let id = new_run_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.as_bytes()[14], b'4');
        assert_ne!(id, new_run_id());
    }
}

//! Queue payloads, deterministic job ids and the job queue port.
//!
//! Job ids are derived from the run id, so at most one execute job and one
//! poll job can exist per run: enqueueing a duplicate id is a no-op.

use crate::engine::EngineContext;
use crate::error::{Result, ShellQueryError};
use crate::metadata::FieldDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Queue receiving [`ExecuteJob`] payloads.
pub const EXECUTE_QUEUE: &str = "execute-shell-query";

/// Queue receiving [`PollJob`] payloads.
pub const POLL_QUEUE: &str = "poll-shell-query";

/// Payload fields removed from a finished execute job.
pub const SENSITIVE_FIELDS: &[&str] = &["sqlText", "tableMetadata"];

pub fn execute_job_id(run_id: &str) -> String {
    format!("execute-{run_id}")
}

pub fn poll_job_id(run_id: &str) -> String {
    format!("poll-{run_id}")
}

/// Starts a run: validate, provision, dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJob {
    pub run_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub mid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<String>,
    /// Encrypted SQL text; empty once stripped from a finished job.
    #[serde(default)]
    pub sql_text: String,
    /// Client-supplied field definitions keyed by table name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_metadata: Option<HashMap<String, Vec<FieldDefinition>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_destination_key: Option<String>,
}

impl ExecuteJob {
    pub fn engine_context(&self) -> EngineContext {
        EngineContext {
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            mid: self.mid.clone(),
            eid: self.eid.clone(),
        }
    }
}

/// Checks a dispatched task until it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollJob {
    pub run_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub mid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<String>,
    pub task_id: String,
    pub query_definition_id: String,
    pub query_customer_key: String,
    /// Customer key of the destination the query writes to.
    pub destination_key: String,
    #[serde(default)]
    pub poll_count: u32,
    pub poll_started_at: DateTime<Utc>,
    #[serde(default)]
    pub not_running_detected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_running_confirmations: u32,
    #[serde(default)]
    pub rowset_ready_attempts: u32,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl PollJob {
    pub fn engine_context(&self) -> EngineContext {
        EngineContext {
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            mid: self.mid.clone(),
            eid: self.eid.clone(),
        }
    }
}

/// A job of either kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Execute(ExecuteJob),
    Poll(PollJob),
}

impl Job {
    pub fn queue(&self) -> &'static str {
        match self {
            Self::Execute(_) => EXECUTE_QUEUE,
            Self::Poll(_) => POLL_QUEUE,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Execute(job) => execute_job_id(&job.run_id),
            Self::Poll(job) => poll_job_id(&job.run_id),
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Execute(job) => &job.run_id,
            Self::Poll(job) => &job.run_id,
        }
    }

    /// Serializes the payload for storage.
    pub fn payload(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Execute(job) => serde_json::to_value(job),
            Self::Poll(job) => serde_json::to_value(job),
        };
        value.map_err(|e| ShellQueryError::internal(format!("Failed to serialize job: {e}")))
    }

    /// Rebuilds a job from its queue name and stored payload.
    pub fn from_payload(queue: &str, payload: serde_json::Value) -> Result<Self> {
        let job = match queue {
            EXECUTE_QUEUE => serde_json::from_value(payload).map(Self::Execute),
            POLL_QUEUE => serde_json::from_value(payload).map(Self::Poll),
            other => return Err(ShellQueryError::input(format!("Unknown queue '{other}'"))),
        };
        job.map_err(|e| ShellQueryError::input(format!("Malformed {queue} payload: {e}")))
    }
}

/// Removes [`SENSITIVE_FIELDS`] from a stored payload.
pub fn strip_sensitive(payload: &mut serde_json::Value) {
    if let Some(object) = payload.as_object_mut() {
        for field in SENSITIVE_FIELDS {
            object.remove(*field);
        }
    }
}

/// Result recorded for a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "status",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum JobResult {
    Canceled {
        run_id: String,
    },
    PollEnqueued {
        run_id: String,
        task_id: String,
        query_definition_id: String,
    },
    Ready {
        run_id: String,
    },
    Failed {
        run_id: String,
        error_message: String,
    },
    Timeout {
        run_id: String,
    },
    BudgetExceeded {
        run_id: String,
        poll_count: u32,
    },
    /// Test mode: the poll job that would have been rescheduled.
    Polling {
        run_id: String,
        delay_ms: u64,
        job: PollJob,
    },
}

impl JobResult {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Canceled { run_id }
            | Self::PollEnqueued { run_id, .. }
            | Self::Ready { run_id }
            | Self::Failed { run_id, .. }
            | Self::Timeout { run_id }
            | Self::BudgetExceeded { run_id, .. }
            | Self::Polling { run_id, .. } => run_id,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Canceled { .. } => "canceled",
            Self::PollEnqueued { .. } => "poll-enqueued",
            Self::Ready { .. } => "ready",
            Self::Failed { .. } => "failed",
            Self::Timeout { .. } => "timeout",
            Self::BudgetExceeded { .. } => "budget-exceeded",
            Self::Polling { .. } => "polling",
        }
    }
}

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delayed" => Self::Delayed,
            "active" => Self::Active,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Waiting,
        }
    }
}

/// A job as held by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: String,
    pub job: Job,
    pub state: JobState,
    /// Deliveries that ended in a retry.
    pub attempts_made: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<JobResult>,
}

/// Durable job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Adds a job to run after `delay`. Returns false when a job with the same
    /// id already exists.
    async fn enqueue(&self, job: &Job, delay: Duration) -> Result<bool>;

    /// Claims the next due job, marking it active.
    async fn claim_next(&self) -> Result<Option<QueuedJob>>;

    /// Marks a job completed with its result.
    async fn complete(&self, job_id: &str, result: &JobResult) -> Result<()>;

    /// Puts an active job back to sleep with an updated payload, without
    /// counting an attempt.
    async fn reschedule(&self, job: &Job, delay: Duration) -> Result<()>;

    /// Schedules another delivery after a failed attempt.
    async fn retry(&self, job_id: &str, error: &str, delay: Duration) -> Result<()>;

    /// Marks a job permanently failed.
    async fn fail(&self, job_id: &str, error: &str) -> Result<()>;

    async fn get(&self, job_id: &str) -> Result<Option<QueuedJob>>;

    /// Removes [`SENSITIVE_FIELDS`] from a job's stored payload.
    async fn strip_sensitive_fields(&self, job_id: &str) -> Result<()>;
}

//! The job state machine.
//!
//! [`JobProcessor::process`] handles one delivery of an execute or poll job
//! and reports what the queue should do next as an [`Outcome`]. It never
//! sleeps: a poll that needs to wait returns [`Outcome::Suspend`] and is
//! invoked again once the delay has passed.
//!
//! Run state and status events change only when a job reaches a terminal
//! result. A failed delivery that the queue will retry leaves both untouched,
//! so subscribers never see a failure followed by a success.

mod backoff;
mod execute;
mod poll;

pub use backoff::{poll_delay, poll_delay_with, rowset_probe_delay};

use crate::config::{PollingConfig, ResultsConfig};
use crate::crypto::Cipher;
use crate::engine::{EngineClient, EngineContext};
use crate::error::ShellQueryError;
use crate::jobs::{Job, JobQueue, JobResult, PollJob};
use crate::run::RunStore;
use crate::status::{StatusKind, StatusPublisher};
use crate::strategy::{query_customer_key, TenantSettingsStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the queue should do with a job after one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Finished; record the result.
    Completed(JobResult),
    /// Not finished; run again after `delay` with the updated payload.
    Suspend { delay: Duration, job: PollJob },
    /// Failed, but another delivery may succeed.
    Retry(ShellQueryError),
    /// Failed for good; the run has been marked failed.
    Terminal(ShellQueryError),
}

/// Delivery bookkeeping supplied by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    /// Deliveries that already failed.
    pub attempts_made: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn new(attempts_made: u32, max_attempts: u32) -> Self {
        Self {
            attempts_made,
            max_attempts,
        }
    }

    /// Returns true if a failure now exhausts the job's attempts.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made + 1 >= self.max_attempts
    }
}

pub struct JobProcessor {
    engine: Arc<dyn EngineClient>,
    runs: Arc<dyn RunStore>,
    queue: Arc<dyn JobQueue>,
    settings: Arc<dyn TenantSettingsStore>,
    status: Arc<dyn StatusPublisher>,
    cipher: Arc<dyn Cipher>,
    polling: PollingConfig,
    results: ResultsConfig,
}

impl JobProcessor {
    pub fn new(
        engine: Arc<dyn EngineClient>,
        runs: Arc<dyn RunStore>,
        queue: Arc<dyn JobQueue>,
        settings: Arc<dyn TenantSettingsStore>,
        status: Arc<dyn StatusPublisher>,
        cipher: Arc<dyn Cipher>,
    ) -> Self {
        Self {
            engine,
            runs,
            queue,
            settings,
            status,
            cipher,
            polling: PollingConfig::default(),
            results: ResultsConfig::default(),
        }
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_results(mut self, results: ResultsConfig) -> Self {
        self.results = results;
        self
    }

    pub fn polling(&self) -> &PollingConfig {
        &self.polling
    }

    /// Handles one delivery of `job`.
    pub async fn process(&self, job: &Job, delivery: JobContext) -> Outcome {
        debug!(
            run_id = job.run_id(),
            queue = job.queue(),
            attempt = delivery.attempts_made + 1,
            "Processing job"
        );
        let result = match job {
            Job::Execute(execute) => self.execute(execute).await,
            Job::Poll(poll) => self.poll(poll).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(err) => self.handle_failure(job, delivery, err).await,
        }
    }

    async fn handle_failure(&self, job: &Job, delivery: JobContext, err: ShellQueryError) -> Outcome {
        let run_id = job.run_id();
        if err.is_retryable() && !delivery.is_final_attempt() {
            warn!(
                run_id,
                attempt = delivery.attempts_made + 1,
                max_attempts = delivery.max_attempts,
                "Job failed, will retry: {err}"
            );
            return Outcome::Retry(err);
        }

        error!(run_id, category = err.category(), "Job failed permanently: {err}");
        let message = failure_message(&err);
        self.fail_run(run_id, &message).await;

        let (ctx, definition_id) = match job {
            Job::Execute(execute) => (execute.engine_context(), None),
            Job::Poll(poll) => (poll.engine_context(), Some(poll.query_definition_id.clone())),
        };
        match definition_id {
            Some(id) => self.delete_query_definition(&ctx, run_id, &id).await,
            None => self.delete_query_definition_by_key(&ctx, run_id).await,
        }
        Outcome::Terminal(err)
    }

    /// Marks the run failed and announces it, unless the run already ended.
    async fn fail_run(&self, run_id: &str, message: &str) {
        match self.runs.mark_failed(run_id, message).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(run_id, "Run already terminal, not marking failed");
                return;
            }
            Err(e) => warn!(run_id, "Failed to mark run failed: {e}"),
        }
        self.publish(run_id, StatusKind::Failed, Some(message)).await;
    }

    /// Publishes a terminal status. A lost event must not fail the job.
    async fn publish(&self, run_id: &str, kind: StatusKind, error_message: Option<&str>) {
        if let Err(e) = self.status.publish(run_id, kind, error_message).await {
            warn!(run_id, "Failed to publish {:?} status: {e}", kind);
        }
    }

    async fn delete_query_definition(&self, ctx: &EngineContext, run_id: &str, id: &str) {
        match self.engine.delete_query_definition(ctx, id).await {
            Ok(()) => debug!(run_id, query_definition_id = id, "Deleted query definition"),
            Err(e) => warn!(run_id, query_definition_id = id, "Failed to delete query definition: {e}"),
        }
    }

    /// Cleans up after a failed execute job, which may or may not have
    /// created its query definition.
    async fn delete_query_definition_by_key(&self, ctx: &EngineContext, run_id: &str) {
        let key = query_customer_key(run_id);
        match self.engine.find_query_definition(ctx, &key).await {
            Ok(Some(definition)) => self.delete_query_definition(ctx, run_id, &definition.id).await,
            Ok(None) => {}
            Err(e) => warn!(run_id, "Failed to look up query definition for cleanup: {e}"),
        }
    }

    /// Wait `delay` and poll again, or in test mode report the job instead.
    fn suspend(&self, job: PollJob, delay: Duration) -> Outcome {
        if self.polling.test_mode {
            return Outcome::Completed(JobResult::Polling {
                run_id: job.run_id.clone(),
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                job,
            });
        }
        Outcome::Suspend { delay, job }
    }

    async fn strip_execute_payload(&self, run_id: &str) {
        let job_id = crate::jobs::execute_job_id(run_id);
        if let Err(e) = self.queue.strip_sensitive_fields(&job_id).await {
            warn!(run_id, "Failed to strip sensitive job fields: {e}");
        } else {
            info!(run_id, "Stripped sensitive fields from execute job");
        }
    }
}

/// Error text stored on the run and sent to subscribers.
fn failure_message(err: &ShellQueryError) -> String {
    match err {
        ShellQueryError::Validation {
            message,
            violations,
        } if !violations.is_empty() && !message.contains(&violations[0]) => {
            format!("{message}: {}", violations.join("; "))
        }
        ShellQueryError::Validation { message, .. } => message.clone(),
        ShellQueryError::Input(message)
        | ShellQueryError::NotFound(message)
        | ShellQueryError::BadRequest(message)
        | ShellQueryError::Timeout(message)
        | ShellQueryError::BudgetExceeded(message) => message.clone(),
        ShellQueryError::Upstream { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

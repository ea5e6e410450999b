use super::{JobProcessor, Outcome};
use crate::error::{Result, ShellQueryError};
use crate::jobs::{ExecuteJob, Job, JobResult, PollJob};
use crate::run::RunStatus;
use crate::status::{StatusKind, StatusReporter};
use crate::strategy::{
    query_customer_key, temp_destination_key, ExecutionStrategy, StrategyContext,
};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

impl JobProcessor {
    /// Validates, provisions and dispatches a run, then hands it to polling.
    pub(super) async fn execute(&self, job: &ExecuteJob) -> Result<Outcome> {
        let run_id = job.run_id.as_str();
        let run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| ShellQueryError::not_found(format!("Run '{run_id}' not found")))?;
        match run.status {
            RunStatus::Queued => {}
            RunStatus::Canceled => {
                info!(run_id, "Run canceled before execution");
                return Ok(Outcome::Completed(JobResult::Canceled {
                    run_id: run_id.to_string(),
                }));
            }
            RunStatus::Running => {
                debug!(run_id, "Run already dispatched, skipping execution");
                let destination_key = match ExecutionStrategy::for_job(job) {
                    ExecutionStrategy::RunToTarget { destination_key } => destination_key,
                    ExecutionStrategy::RunToTemp => temp_destination_key(run_id),
                };
                return self
                    .enqueue_poll(
                        job,
                        run.task_id.unwrap_or_default(),
                        run.query_definition_id.unwrap_or_default(),
                        query_customer_key(run_id),
                        destination_key,
                    )
                    .await;
            }
            RunStatus::Ready => {
                debug!(run_id, "Run already ready, skipping execution");
                return Ok(Outcome::Completed(JobResult::Ready {
                    run_id: run_id.to_string(),
                }));
            }
            RunStatus::Failed => {
                debug!(run_id, "Run already failed, skipping execution");
                return Ok(Outcome::Completed(JobResult::Failed {
                    run_id: run_id.to_string(),
                    error_message: run.error_message.unwrap_or_default(),
                }));
            }
        }

        let sql = self
            .cipher
            .decrypt(&job.sql_text)
            .map_err(|e| ShellQueryError::input(format!("Failed to decrypt SQL payload: {e}")))?
            .ok_or_else(|| ShellQueryError::input("SQL payload is empty"))?;

        let reporter = StatusReporter::new(self.status.as_ref(), run_id);
        reporter.checkpoint(StatusKind::Queued).await;

        let strategy = ExecutionStrategy::for_job(job);
        debug!(run_id, strategy = strategy.name(), "Executing");
        let flow = strategy
            .execute(
                StrategyContext {
                    engine: self.engine.as_ref(),
                    settings: self.settings.as_ref(),
                    results: &self.results,
                },
                job,
                &sql,
                reporter,
            )
            .await?;

        self.runs
            .mark_running(run_id, &flow.task_id, &flow.query_definition_id)
            .await?;

        self.enqueue_poll(
            job,
            flow.task_id,
            flow.query_definition_id,
            flow.query_customer_key,
            flow.destination_key,
        )
        .await
    }

    /// Enqueues the run's poll job. A poll job that already exists is kept.
    async fn enqueue_poll(
        &self,
        job: &ExecuteJob,
        task_id: String,
        query_definition_id: String,
        query_customer_key: String,
        destination_key: String,
    ) -> Result<Outcome> {
        let run_id = job.run_id.as_str();
        let poll = PollJob {
            run_id: run_id.to_string(),
            tenant_id: job.tenant_id.clone(),
            user_id: job.user_id.clone(),
            mid: job.mid.clone(),
            eid: job.eid.clone(),
            task_id: task_id.clone(),
            query_definition_id: query_definition_id.clone(),
            query_customer_key,
            destination_key,
            poll_count: 0,
            poll_started_at: Utc::now(),
            not_running_detected_at: None,
            not_running_confirmations: 0,
            rowset_ready_attempts: 0,
            last_checked_at: None,
        };
        let first_poll = if self.polling.test_mode {
            Duration::ZERO
        } else {
            Duration::from_millis(self.polling.backoff_base_ms)
        };
        if !self.queue.enqueue(&Job::Poll(poll), first_poll).await? {
            debug!(run_id, "Poll job already enqueued");
        }

        info!(run_id, task_id = %task_id, "Poll enqueued");
        Ok(Outcome::Completed(JobResult::PollEnqueued {
            run_id: run_id.to_string(),
            task_id,
            query_definition_id,
        }))
    }
}

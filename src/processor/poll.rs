use super::{poll_delay, rowset_probe_delay, JobProcessor, Outcome};
use crate::engine::{AsyncStatus, EngineContext};
use crate::error::{Result, ShellQueryError};
use crate::jobs::{JobResult, PollJob};
use crate::run::RunStatus;
use crate::status::StatusKind;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

const GENERIC_FAILURE: &str = "Query execution failed";

fn elapsed_since(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or_default()
}

impl JobProcessor {
    /// Checks a dispatched task once and decides whether the run is done.
    pub(super) async fn poll(&self, job: &PollJob) -> Result<Outcome> {
        let run_id = job.run_id.as_str();
        let ctx = job.engine_context();
        let now = Utc::now();

        let run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| ShellQueryError::not_found(format!("Run '{run_id}' not found")))?;
        match run.status {
            RunStatus::Canceled => return Ok(self.finish_canceled(job, &ctx).await),
            RunStatus::Ready => {
                return Ok(Outcome::Completed(JobResult::Ready {
                    run_id: run_id.to_string(),
                }))
            }
            RunStatus::Failed => {
                return Ok(Outcome::Completed(JobResult::Failed {
                    run_id: run_id.to_string(),
                    error_message: run.error_message.unwrap_or_else(|| GENERIC_FAILURE.to_string()),
                }))
            }
            RunStatus::Queued | RunStatus::Running => {}
        }

        let elapsed = elapsed_since(job.poll_started_at, now);
        if elapsed > self.polling.max_duration() {
            let message = format!("Query timed out after {} seconds", elapsed.as_secs());
            warn!(run_id, elapsed_secs = elapsed.as_secs(), "Polling timed out");
            self.finish_failed(job, &ctx, &message).await;
            return Ok(Outcome::Completed(JobResult::Timeout {
                run_id: run_id.to_string(),
            }));
        }
        if job.poll_count > self.polling.max_poll_count {
            let message = format!(
                "Query did not complete within {} status checks",
                self.polling.max_poll_count
            );
            warn!(run_id, poll_count = job.poll_count, "Poll budget exceeded");
            self.finish_failed(job, &ctx, &message).await;
            return Ok(Outcome::Completed(JobResult::BudgetExceeded {
                run_id: run_id.to_string(),
                poll_count: job.poll_count,
            }));
        }

        if job.rowset_ready_attempts > 0 {
            return self.probe_rowset(job.clone(), &ctx, now).await;
        }

        let task = self.engine.get_task_status(&ctx, &job.task_id).await?;
        debug!(
            run_id,
            task_id = %job.task_id,
            poll_count = job.poll_count,
            status = %task.status,
            "Task status"
        );
        if task.status.is_error() {
            let message = task
                .error_message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| GENERIC_FAILURE.to_string());
            self.finish_failed(job, &ctx, &message).await;
            return Ok(Outcome::Completed(JobResult::Failed {
                run_id: run_id.to_string(),
                error_message: message,
            }));
        }
        if task.status == AsyncStatus::Complete {
            return self.probe_rowset(job.clone(), &ctx, now).await;
        }

        self.check_liveness(job.clone(), &ctx, now, elapsed).await
    }

    /// Handles a task that still reports pending: fast path, stuck detection,
    /// then backoff.
    async fn check_liveness(
        &self,
        mut job: PollJob,
        ctx: &EngineContext,
        now: DateTime<Utc>,
        elapsed: Duration,
    ) -> Result<Outcome> {
        let run_id = job.run_id.clone();

        if elapsed >= self.polling.fast_path_min_runtime() {
            match self.engine.get_rowset(ctx, &job.destination_key, 1, 1).await {
                Ok(rowset) if !rowset.items.is_empty() => {
                    info!(run_id = %run_id, "Rows present before status flag, treating as complete");
                    return self.finish_ready(&job).await;
                }
                Ok(_) => {}
                Err(e) => debug!(run_id = %run_id, "Fast-path rowset probe failed: {e}"),
            }
        }

        if elapsed >= self.polling.stuck_threshold() {
            match self.engine.is_running(ctx, &job.task_id).await {
                Ok(true) => {
                    job.not_running_detected_at = None;
                    job.not_running_confirmations = 0;
                }
                Ok(false) => match job.not_running_detected_at {
                    None => {
                        debug!(run_id = %run_id, "Task reported not running, awaiting confirmation");
                        job.not_running_detected_at = Some(now);
                        job.not_running_confirmations = 1;
                    }
                    Some(first)
                        if elapsed_since(first, now)
                            >= self.polling.not_running_confirmation_gap() =>
                    {
                        job.not_running_confirmations += 1;
                        info!(
                            run_id = %run_id,
                            elapsed_secs = elapsed.as_secs(),
                            "Task confirmed not running, checking results"
                        );
                        return self.probe_rowset(job, ctx, now).await;
                    }
                    Some(_) => {}
                },
                Err(e) => warn!(run_id = %run_id, "isRunning check failed: {e}"),
            }
        }

        let delay = poll_delay(&self.polling, job.poll_count);
        job.poll_count += 1;
        job.last_checked_at = Some(now);
        debug!(
            run_id = %run_id,
            poll_count = job.poll_count,
            delay_ms = delay.as_millis() as u64,
            "Rescheduling poll"
        );
        Ok(self.suspend(job, delay))
    }

    /// Reads one row to confirm the destination is queryable. Gives up after
    /// the configured attempts and declares the run ready anyway: an empty
    /// result set never produces a row.
    async fn probe_rowset(
        &self,
        mut job: PollJob,
        ctx: &EngineContext,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        if job.rowset_ready_attempts == 0 {
            self.publish(&job.run_id, StatusKind::FetchingResults, None)
                .await;
        }
        let attempt = job.rowset_ready_attempts + 1;
        let ready = match self
            .engine
            .get_rowset(ctx, &job.destination_key, 1, 1)
            .await
        {
            Ok(rowset) => !rowset.items.is_empty(),
            Err(e) => {
                debug!(run_id = %job.run_id, attempt, "Rowset probe failed: {e}");
                false
            }
        };

        if ready || attempt >= self.polling.rowset_ready_attempts {
            if !ready {
                debug!(run_id = %job.run_id, "Rowset probe exhausted, declaring ready");
            }
            return self.finish_ready(&job).await;
        }

        job.rowset_ready_attempts = attempt;
        job.last_checked_at = Some(now);
        Ok(self.suspend(job, rowset_probe_delay(&self.polling, attempt)))
    }

    async fn finish_ready(&self, job: &PollJob) -> Result<Outcome> {
        let run_id = job.run_id.as_str();
        if self.runs.mark_ready(run_id).await? {
            info!(run_id, poll_count = job.poll_count, "Run ready");
            self.publish(run_id, StatusKind::Ready, None).await;
            self.strip_execute_payload(run_id).await;
        } else {
            debug!(run_id, "Run already terminal, not marking ready");
        }
        Ok(Outcome::Completed(JobResult::Ready {
            run_id: run_id.to_string(),
        }))
    }

    async fn finish_failed(&self, job: &PollJob, ctx: &EngineContext, message: &str) {
        self.fail_run(&job.run_id, message).await;
        self.delete_query_definition(ctx, &job.run_id, &job.query_definition_id)
            .await;
    }

    async fn finish_canceled(&self, job: &PollJob, ctx: &EngineContext) -> Outcome {
        info!(run_id = %job.run_id, "Run canceled, cleaning up");
        self.delete_query_definition(ctx, &job.run_id, &job.query_definition_id)
            .await;
        self.publish(&job.run_id, StatusKind::Canceled, None).await;
        Outcome::Completed(JobResult::Canceled {
            run_id: job.run_id.clone(),
        })
    }
}

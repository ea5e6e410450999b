//! Queue worker: claims due jobs and applies the processor's outcome.
//!
//! A job in flight is never interrupted. Shutdown is observed between jobs
//! and while idle.

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::jobs::{Job, JobQueue};
use crate::processor::{JobContext, JobProcessor, Outcome};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    max_attempts: u32,
    retry_backoff: Duration,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, processor: Arc<JobProcessor>, config: &WorkerConfig) -> Self {
        Self {
            queue,
            processor,
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            poll_interval: Duration::from_millis(config.idle_poll_ms),
            jitter: Duration::from_millis(config.idle_jitter_ms),
            shutdown_when_queue_empty: false,
        }
    }

    /// Stop once no job is due instead of idling.
    pub fn shutdown_when_queue_empty(mut self, enabled: bool) -> Self {
        self.shutdown_when_queue_empty = enabled;
        self
    }

    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Delay before the next delivery after `attempts_made` failures.
    fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempts_made))
    }

    /// Runs jobs until `shutdown` fires, or until the queue has nothing due if
    /// `shutdown_when_queue_empty` is set.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                debug!("Worker shutting down");
                break;
            }
            let idle = match self.run_next_job().await {
                Ok(Some(_)) => continue,
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No due jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let duration = self.sleep_duration_with_jitter();
                    trace!("No due jobs found. Polling again in {duration:?}…");
                    duration
                }
                Err(e) => {
                    error!("Failed to run job: {e}");
                    self.sleep_duration_with_jitter()
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(idle) => {}
            }
        }
    }

    /// Runs `concurrency` loops sharing this worker until all of them stop.
    pub async fn run_concurrent(self: Arc<Self>, concurrency: usize, shutdown: CancellationToken) {
        let mut handles = Vec::new();
        for index in 0..concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(
                async move { worker.run(shutdown).await }.instrument(info_span!("worker", index)),
            ));
        }
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Worker task panicked: {e}");
            }
        }
        info!("All workers stopped");
    }

    /// Runs the next due job, if there is one, and returns its id.
    pub async fn run_next_job(&self) -> Result<Option<String>> {
        let Some(queued) = self.queue.claim_next().await? else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %queued.id, run_id = %queued.job.run_id());
        let delivery = JobContext::new(queued.attempts_made, self.max_attempts);
        let outcome = self
            .processor
            .process(&queued.job, delivery)
            .instrument(span.clone())
            .await;

        let _enter = span.enter();
        match outcome {
            Outcome::Completed(result) => {
                debug!(status = result.status(), "Job completed");
                self.queue.complete(&queued.id, &result).await?;
            }
            Outcome::Suspend { delay, job } => {
                debug!(delay_ms = delay.as_millis() as u64, "Job suspended");
                self.queue.reschedule(&Job::Poll(job), delay).await?;
            }
            Outcome::Retry(e) => {
                let delay = self.retry_delay(queued.attempts_made);
                warn!(delay_ms = delay.as_millis() as u64, "Retrying job: {e}");
                self.queue.retry(&queued.id, &e.to_string(), delay).await?;
            }
            Outcome::Terminal(e) => {
                self.queue.fail(&queued.id, &e.to_string()).await?;
            }
        }
        Ok(Some(queued.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollingConfig;
    use crate::crypto::AesGcmCipher;
    use crate::engine::MockEngineClient;
    use crate::error::ShellQueryError;
    use crate::jobs::{poll_job_id, ExecuteJob, JobState};
    use crate::memory::{MemoryEventBus, MemoryJobQueue, MemoryRunStore, MemoryTenantSettings};
    use crate::run::{Run, RunStore};
    use crate::status::EncryptedStatusPublisher;

    fn config() -> WorkerConfig {
        WorkerConfig {
            max_attempts: 2,
            retry_backoff_ms: 1_000,
            idle_poll_ms: 10,
            idle_jitter_ms: 0,
            ..WorkerConfig::default()
        }
    }

    struct Setup {
        engine: Arc<MockEngineClient>,
        queue: Arc<MemoryJobQueue>,
        worker: Worker,
    }

    async fn setup(sql: &str) -> Setup {
        let engine = Arc::new(MockEngineClient::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let runs = Arc::new(MemoryRunStore::new());
        let cipher = Arc::new(AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap());
        let publisher = Arc::new(EncryptedStatusPublisher::new(
            Arc::new(MemoryEventBus::new()),
            cipher.clone(),
            Duration::from_secs(60),
        ));

        runs.create_run(&Run::new("r", "t", "u", "1", "h")).await.unwrap();
        queue
            .enqueue(
                &Job::Execute(ExecuteJob {
                    run_id: "r".to_string(),
                    tenant_id: "t".to_string(),
                    user_id: "u".to_string(),
                    mid: "1".to_string(),
                    eid: None,
                    sql_text: crate::crypto::Cipher::encrypt(cipher.as_ref(), sql).unwrap(),
                    table_metadata: None,
                    target_destination_key: None,
                }),
                Duration::ZERO,
            )
            .await
            .unwrap();

        let processor = Arc::new(
            JobProcessor::new(
                engine.clone(),
                runs,
                queue.clone(),
                Arc::new(MemoryTenantSettings::new()),
                publisher,
                cipher,
            )
            .with_polling(PollingConfig::default()),
        );
        let worker = Worker::new(queue.clone(), processor, &config()).shutdown_when_queue_empty(true);
        Setup {
            engine,
            queue,
            worker,
        }
    }

    #[test]
    fn test_retry_delay_doubles() {
        let worker = Worker {
            queue: Arc::new(MemoryJobQueue::new()),
            processor: Arc::new(JobProcessor::new(
                Arc::new(MockEngineClient::new()),
                Arc::new(MemoryRunStore::new()),
                Arc::new(MemoryJobQueue::new()),
                Arc::new(MemoryTenantSettings::new()),
                Arc::new(EncryptedStatusPublisher::new(
                    Arc::new(MemoryEventBus::new()),
                    Arc::new(AesGcmCipher::new(&[7u8; 32]).unwrap()),
                    Duration::from_secs(1),
                )),
                Arc::new(AesGcmCipher::new(&[7u8; 32]).unwrap()),
            )),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            jitter: Duration::ZERO,
            shutdown_when_queue_empty: true,
        };
        assert_eq!(worker.retry_delay(0), Duration::from_secs(5));
        assert_eq!(worker.retry_delay(2), Duration::from_secs(20));
        assert_eq!(worker.sleep_duration_with_jitter(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_execute_enqueues_delayed_poll() {
        let s = setup("SELECT 1 AS One").await;
        assert_eq!(s.worker.run_next_job().await.unwrap().as_deref(), Some("execute-r"));

        let execute = s.queue.get("execute-r").await.unwrap().unwrap();
        assert_eq!(execute.state, JobState::Completed);
        let poll = s.queue.get(&poll_job_id("r")).await.unwrap().unwrap();
        assert_eq!(poll.state, JobState::Delayed);

        // The poll is not due yet.
        assert!(s.worker.run_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_then_terminal_failure() {
        let s = setup("SELECT 1 AS One").await;
        s.engine.fail_next(
            "create_query_definition",
            ShellQueryError::upstream(Some(500), "boom"),
        );
        s.engine.fail_next(
            "create_query_definition",
            ShellQueryError::upstream(Some(500), "boom"),
        );

        s.worker.run_next_job().await.unwrap();
        let job = s.queue.get("execute-r").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts_made, 1);

        s.queue.release_delayed();
        s.worker.run_next_job().await.unwrap();
        let job = s.queue.get("execute-r").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let s = setup("SELECT 1 AS One").await;
        let worker = s.worker.shutdown_when_queue_empty(false);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), worker.run(shutdown))
            .await
            .unwrap();
    }
}

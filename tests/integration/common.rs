//! Shared setup: a worker over the mock engine and in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use shell_query::config::{PollingConfig, WorkerConfig};
use shell_query::crypto::{AesGcmCipher, Cipher};
use shell_query::engine::MockEngineClient;
use shell_query::jobs::{ExecuteJob, Job, JobQueue};
use shell_query::memory::{MemoryEventBus, MemoryJobQueue, MemoryRunStore, MemoryTenantSettings};
use shell_query::metadata::FieldDefinition;
use shell_query::processor::JobProcessor;
use shell_query::run::{sql_text_hash, Run, RunStore};
use shell_query::status::{channel_for, EncryptedStatusPublisher, StatusEvent, StatusKind};
use shell_query::worker::Worker;

pub struct Pipeline {
    pub engine: Arc<MockEngineClient>,
    pub runs: Arc<MemoryRunStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub bus: Arc<MemoryEventBus>,
    pub cipher: Arc<dyn Cipher>,
    pub publisher: Arc<EncryptedStatusPublisher>,
    pub processor: Arc<JobProcessor>,
    pub worker: Worker,
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        max_attempts: 3,
        retry_backoff_ms: 1,
        idle_poll_ms: 1,
        idle_jitter_ms: 0,
        ..WorkerConfig::default()
    }
}

/// Polling with a short first delay so suspended polls stay in the queue.
pub fn polling_config() -> PollingConfig {
    PollingConfig {
        backoff_base_ms: 1,
        backoff_cap_ms: 1,
        jitter: 0.0,
        ..PollingConfig::default()
    }
}

pub fn pipeline(engine: MockEngineClient) -> Pipeline {
    pipeline_with(engine, polling_config())
}

pub fn pipeline_with(engine: MockEngineClient, polling: PollingConfig) -> Pipeline {
    let engine = Arc::new(engine);
    let runs = Arc::new(MemoryRunStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let bus = Arc::new(MemoryEventBus::new());
    let cipher: Arc<dyn Cipher> =
        Arc::new(AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap());
    let publisher = Arc::new(EncryptedStatusPublisher::new(
        bus.clone(),
        cipher.clone(),
        Duration::from_secs(60),
    ));
    let processor = Arc::new(
        JobProcessor::new(
            engine.clone(),
            runs.clone(),
            queue.clone(),
            Arc::new(MemoryTenantSettings::new()),
            publisher.clone(),
            cipher.clone(),
        )
        .with_polling(polling),
    );
    let worker = Worker::new(queue.clone(), processor.clone(), &worker_config());

    Pipeline {
        engine,
        runs,
        queue,
        bus,
        cipher,
        publisher,
        processor,
        worker,
    }
}

impl Pipeline {
    /// Creates a queued run and its execute job.
    pub async fn submit(&self, run_id: &str, sql: &str, target: Option<&str>) {
        self.submit_with_metadata(run_id, sql, target, None).await;
    }

    pub async fn submit_with_metadata(
        &self,
        run_id: &str,
        sql: &str,
        target: Option<&str>,
        table_metadata: Option<std::collections::HashMap<String, Vec<FieldDefinition>>>,
    ) {
        let mut run = Run::new(run_id, "tenant", "user", "100", sql_text_hash(sql));
        if let Some(key) = target {
            run = run.with_target(key);
        }
        self.runs.create_run(&run).await.unwrap();
        self.queue
            .enqueue(
                &Job::Execute(ExecuteJob {
                    run_id: run_id.to_string(),
                    tenant_id: "tenant".to_string(),
                    user_id: "user".to_string(),
                    mid: "100".to_string(),
                    eid: None,
                    sql_text: self.cipher.encrypt(sql).unwrap(),
                    table_metadata,
                    target_destination_key: target.map(str::to_string),
                }),
                Duration::ZERO,
            )
            .await
            .unwrap();
    }

    /// Runs due jobs, releasing delayed ones, until the queue is idle.
    pub async fn drain(&self) {
        for _ in 0..100 {
            self.queue.release_delayed();
            if self.worker.run_next_job().await.unwrap().is_none() {
                return;
            }
        }
        panic!("queue did not drain");
    }

    /// Decrypted events published for `run_id`, in order.
    pub fn events(&self, run_id: &str) -> Vec<StatusEvent> {
        let channel = channel_for(run_id);
        self.bus
            .published()
            .into_iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, payload)| {
                let json = self.cipher.decrypt(&payload).unwrap().unwrap();
                serde_json::from_str(&json).unwrap()
            })
            .collect()
    }

    pub fn statuses(&self, run_id: &str) -> Vec<StatusKind> {
        self.events(run_id).into_iter().map(|e| e.status).collect()
    }
}

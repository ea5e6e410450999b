//! Application wiring for the command-line entry points.
//!
//! Builds the cipher, state database, engine client and job processor from
//! configuration, and implements the `submit`, `status`, `cancel` and
//! `worker` commands on top of them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{read_sql_arg, Command};
use crate::config::Config;
use crate::crypto::{AesGcmCipher, Cipher};
use crate::engine::{EngineClient, HttpEngineClient, HttpEngineConfig, MockEngineClient};
use crate::error::{Result, ShellQueryError};
use crate::jobs::{ExecuteJob, Job, JobQueue};
use crate::metadata::FieldDefinition;
use crate::persistence::StateDb;
use crate::processor::JobProcessor;
use crate::run::{new_run_id, sql_text_hash, Run, RunStore};
use crate::status::{channel_for, EncryptedStatusPublisher, StatusEvent};
use crate::worker::Worker;

/// A run submission.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub tenant_id: String,
    pub user_id: String,
    pub mid: String,
    pub eid: Option<String>,
    pub sql: String,
    pub target_destination_key: Option<String>,
    pub table_metadata: Option<HashMap<String, Vec<FieldDefinition>>>,
}

/// What `status` reports for a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run: Run,
    pub latest_event: Option<StatusEvent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<StatusEvent>,
}

/// Shared services for one process.
pub struct App {
    config: Config,
    db: Arc<StateDb>,
    cipher: Arc<dyn Cipher>,
    status: Arc<EncryptedStatusPublisher>,
}

impl App {
    /// Opens the state database and builds the cipher from `config`.
    pub async fn new(config: Config) -> Result<Self> {
        let db = match &config.worker.state_db {
            Some(path) => StateDb::open(path).await?,
            None => StateDb::open_default().await?,
        };
        Self::with_db(config, db)
    }

    /// Builds the app around an already opened database.
    pub fn with_db(config: Config, db: StateDb) -> Result<Self> {
        let key = config.crypto.key.as_deref().ok_or_else(|| {
            ShellQueryError::config(
                "No encryption key configured. Set crypto.key or SHELL_QUERY_ENCRYPTION_KEY",
            )
        })?;
        let cipher: Arc<dyn Cipher> = Arc::new(AesGcmCipher::from_base64_key(key)?);
        let db = Arc::new(db);
        let status = Arc::new(EncryptedStatusPublisher::new(
            db.clone(),
            cipher.clone(),
            config.status.latest_event_ttl(),
        ));

        Ok(Self {
            config,
            db,
            cipher,
            status,
        })
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    /// Dispatches a parsed command.
    pub async fn run_command(&self, command: Command) -> Result<()> {
        match command {
            Command::Worker {
                once, mock_engine, ..
            } => {
                let engine: Arc<dyn EngineClient> = if mock_engine {
                    warn!("Using the in-memory mock engine");
                    Arc::new(MockEngineClient::new())
                } else {
                    let config = HttpEngineConfig::from_config(&self.config.engine)?;
                    Arc::new(HttpEngineClient::new(config)?)
                };
                let shutdown = CancellationToken::new();
                let signal = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Interrupt received, finishing in-flight jobs");
                        signal.cancel();
                    }
                });
                self.run_worker(engine, once, shutdown).await
            }
            Command::Submit {
                tenant,
                user,
                mid,
                eid,
                sql,
                target,
                table_metadata,
            } => {
                let table_metadata = table_metadata
                    .as_deref()
                    .map(read_table_metadata)
                    .transpose()?;
                let run_id = self
                    .submit(Submission {
                        tenant_id: tenant,
                        user_id: user,
                        mid,
                        eid,
                        sql: read_sql_arg(&sql)?,
                        target_destination_key: target,
                        table_metadata,
                    })
                    .await?;
                println!("{run_id}");
                Ok(())
            }
            Command::Status { run_id, events } => {
                let report = self.report(&run_id, events).await?;
                let json = serde_json::to_string_pretty(&report).map_err(|e| {
                    ShellQueryError::internal(format!("Failed to serialize report: {e}"))
                })?;
                println!("{json}");
                Ok(())
            }
            Command::Cancel { run_id } => {
                if self.cancel(&run_id).await? {
                    println!("Run {run_id} canceled");
                } else {
                    println!("Run {run_id} already finished");
                }
                Ok(())
            }
        }
    }

    /// Builds a processor over `engine` and the app's stores.
    pub fn processor(&self, engine: Arc<dyn EngineClient>) -> JobProcessor {
        JobProcessor::new(
            engine,
            self.db.clone(),
            self.db.clone(),
            self.db.clone(),
            self.status.clone(),
            self.cipher.clone(),
        )
        .with_polling(self.config.polling.clone())
        .with_results(self.config.results.clone())
    }

    /// Processes jobs until `shutdown` fires, or until nothing is due when
    /// `once` is set.
    pub async fn run_worker(
        &self,
        engine: Arc<dyn EngineClient>,
        once: bool,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let processor = Arc::new(self.processor(engine));
        let worker = Worker::new(self.db.clone(), processor, &self.config.worker)
            .shutdown_when_queue_empty(once);

        if once {
            worker.run(shutdown).await;
        } else {
            info!(concurrency = self.config.worker.concurrency, "Worker started");
            Arc::new(worker)
                .run_concurrent(self.config.worker.concurrency, shutdown)
                .await;
        }
        Ok(())
    }

    /// Creates a queued run and enqueues its execute job. Returns the run id.
    pub async fn submit(&self, submission: Submission) -> Result<String> {
        if submission.sql.trim().is_empty() {
            return Err(ShellQueryError::input("SQL text is empty"));
        }
        let run_id = new_run_id();
        let target = submission
            .target_destination_key
            .filter(|key| !key.trim().is_empty());

        let mut run = Run::new(
            &run_id,
            &submission.tenant_id,
            &submission.user_id,
            &submission.mid,
            sql_text_hash(&submission.sql),
        );
        if let Some(key) = &target {
            run = run.with_target(key);
        }
        self.db.create_run(&run).await?;

        let job = Job::Execute(ExecuteJob {
            run_id: run_id.clone(),
            tenant_id: submission.tenant_id,
            user_id: submission.user_id,
            mid: submission.mid,
            eid: submission.eid,
            sql_text: self.cipher.encrypt(&submission.sql)?,
            table_metadata: submission.table_metadata,
            target_destination_key: target,
        });
        self.db.enqueue(&job, std::time::Duration::ZERO).await?;

        info!(run_id = %run_id, "Run submitted");
        Ok(run_id)
    }

    /// Reads a run with its latest event and, optionally, every event.
    pub async fn report(&self, run_id: &str, with_events: bool) -> Result<RunReport> {
        let run = self
            .db
            .get_run(run_id)
            .await?
            .ok_or_else(|| ShellQueryError::not_found(format!("Run '{run_id}' not found")))?;
        let latest_event = self.status.latest(run_id).await?;

        let mut events = Vec::new();
        if with_events {
            for stored in self.db.events(&channel_for(run_id), 0).await? {
                let Some(json) = self.cipher.decrypt(&stored.payload)? else {
                    warn!(event_id = stored.id, "Skipping unreadable status event");
                    continue;
                };
                match serde_json::from_str(&json) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(event_id = stored.id, "Skipping malformed status event: {e}"),
                }
            }
        }

        Ok(RunReport {
            run,
            latest_event,
            events,
        })
    }

    /// Marks a run canceled. The worker removes remote artifacts and
    /// publishes the canceled event on its next poll.
    pub async fn cancel(&self, run_id: &str) -> Result<bool> {
        if self.db.get_run(run_id).await?.is_none() {
            return Err(ShellQueryError::not_found(format!("Run '{run_id}' not found")));
        }
        self.db.mark_canceled(run_id).await
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}

/// Reads a `{ "table": [field, ...] }` JSON file.
fn read_table_metadata(path: &Path) -> Result<HashMap<String, Vec<FieldDefinition>>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ShellQueryError::input(format!(
            "Failed to read table metadata '{}': {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| ShellQueryError::input(format!("Malformed table metadata: {e}")))
}

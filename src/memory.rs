//! In-memory stores for tests and single-process runs.
//!
//! All state lives behind `std::sync::Mutex`: every operation is a short map
//! access and no lock is held across an await.

use crate::error::{Result, ShellQueryError};
use crate::jobs::{strip_sensitive, Job, JobQueue, JobResult, JobState, QueuedJob};
use crate::run::{Run, RunStatus, RunStore};
use crate::status::EventBus;
use crate::strategy::TenantSettingsStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Run records in a map.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `update` if the run may move to `next`.
    fn transition(&self, run_id: &str, next: RunStatus, update: impl FnOnce(&mut Run)) -> bool {
        let mut runs = lock(&self.runs);
        match runs.get_mut(run_id) {
            Some(run) if run.status.can_transition_to(next) => {
                run.status = next;
                run.updated_at = Utc::now();
                if next.is_terminal() {
                    run.completed_at = Some(run.updated_at);
                }
                update(run);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut runs = lock(&self.runs);
        if runs.contains_key(&run.id) {
            return Err(ShellQueryError::persistence(format!(
                "Run '{}' already exists",
                run.id
            )));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(lock(&self.runs).get(run_id).cloned())
    }

    async fn mark_running(
        &self,
        run_id: &str,
        task_id: &str,
        query_definition_id: &str,
    ) -> Result<bool> {
        Ok(self.transition(run_id, RunStatus::Running, |run| {
            run.task_id = Some(task_id.to_string());
            run.query_definition_id = Some(query_definition_id.to_string());
        }))
    }

    async fn mark_ready(&self, run_id: &str) -> Result<bool> {
        Ok(self.transition(run_id, RunStatus::Ready, |_| {}))
    }

    async fn mark_failed(&self, run_id: &str, error_message: &str) -> Result<bool> {
        Ok(self.transition(run_id, RunStatus::Failed, |run| {
            run.error_message = Some(error_message.to_string());
        }))
    }

    async fn mark_canceled(&self, run_id: &str) -> Result<bool> {
        Ok(self.transition(run_id, RunStatus::Canceled, |_| {}))
    }
}

/// Tenant settings keyed by (tenant, mid).
#[derive(Default)]
pub struct MemoryTenantSettings {
    folders: Mutex<HashMap<(String, String), i64>>,
}

impl MemoryTenantSettings {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantSettingsStore for MemoryTenantSettings {
    async fn get_results_folder_id(&self, tenant_id: &str, mid: &str) -> Result<Option<i64>> {
        Ok(lock(&self.folders)
            .get(&(tenant_id.to_string(), mid.to_string()))
            .copied())
    }

    async fn upsert_results_folder_id(
        &self,
        tenant_id: &str,
        mid: &str,
        folder_id: i64,
    ) -> Result<()> {
        lock(&self.folders).insert((tenant_id.to_string(), mid.to_string()), folder_id);
        Ok(())
    }
}

/// Job queue in a map, ordered by due time.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<String, QueuedJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every delayed job due now.
    pub fn release_delayed(&self) {
        let now = Utc::now();
        for job in lock(&self.jobs).values_mut() {
            if job.state == JobState::Delayed {
                job.run_at = now;
            }
        }
    }

    /// Ids of all jobs currently held.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = lock(&self.jobs).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut QueuedJob)) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ShellQueryError::persistence(format!("Job '{job_id}' not found")))?;
        apply(job);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &Job, delay: Duration) -> Result<bool> {
        let mut jobs = lock(&self.jobs);
        let id = job.id();
        if jobs.contains_key(&id) {
            return Ok(false);
        }
        jobs.insert(
            id.clone(),
            QueuedJob {
                id,
                job: job.clone(),
                state: if delay.is_zero() {
                    JobState::Waiting
                } else {
                    JobState::Delayed
                },
                attempts_made: 0,
                run_at: after(delay),
                last_error: None,
                result: None,
            },
        );
        Ok(true)
    }

    async fn claim_next(&self) -> Result<Option<QueuedJob>> {
        let now = Utc::now();
        let mut jobs = lock(&self.jobs);
        let next = jobs
            .values_mut()
            .filter(|j| matches!(j.state, JobState::Waiting | JobState::Delayed) && j.run_at <= now)
            .min_by_key(|j| j.run_at);
        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.clone()
        }))
    }

    async fn complete(&self, job_id: &str, result: &JobResult) -> Result<()> {
        self.update(job_id, |job| {
            job.state = JobState::Completed;
            job.result = Some(result.clone());
        })
    }

    async fn reschedule(&self, job: &Job, delay: Duration) -> Result<()> {
        self.update(&job.id(), |queued| {
            queued.job = job.clone();
            queued.state = JobState::Delayed;
            queued.run_at = after(delay);
        })
    }

    async fn retry(&self, job_id: &str, error: &str, delay: Duration) -> Result<()> {
        self.update(job_id, |job| {
            job.attempts_made += 1;
            job.last_error = Some(error.to_string());
            job.state = JobState::Delayed;
            job.run_at = after(delay);
        })
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        self.update(job_id, |job| {
            job.attempts_made += 1;
            job.last_error = Some(error.to_string());
            job.state = JobState::Failed;
        })
    }

    async fn get(&self, job_id: &str) -> Result<Option<QueuedJob>> {
        Ok(lock(&self.jobs).get(job_id).cloned())
    }

    async fn strip_sensitive_fields(&self, job_id: &str) -> Result<()> {
        let mut jobs = lock(&self.jobs);
        let Some(queued) = jobs.get_mut(job_id) else {
            return Ok(());
        };
        let mut payload = queued.job.payload()?;
        strip_sensitive(&mut payload);
        queued.job = Job::from_payload(queued.job.queue(), payload)?;
        Ok(())
    }
}

/// Broadcast channel plus an expiring key-value map.
pub struct MemoryEventBus {
    sender: broadcast::Sender<(String, String)>,
    published: Mutex<Vec<(String, String)>>,
    values: Mutex<HashMap<String, (String, Instant)>>,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            published: Mutex::new(Vec::new()),
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to every `(channel, payload)` published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.sender.subscribe()
    }

    /// Every `(channel, payload)` published so far.
    pub fn published(&self) -> Vec<(String, String)> {
        lock(&self.published).clone()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let message = (channel.to_string(), payload.to_string());
        lock(&self.published).push(message.clone());
        // No subscribers is not an error.
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        lock(&self.values).insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut values = lock(&self.values);
        match values.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

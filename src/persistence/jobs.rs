//! Job queue persistence.
//!
//! Job ids are deterministic, so the primary key doubles as the dedupe key.
//! Claiming is a single `UPDATE ... RETURNING` so two workers can never
//! claim the same job.

use super::{from_db_time, to_db_time, StateDb};
use crate::error::{Result, ShellQueryError};
use crate::jobs::{Job, JobQueue, JobResult, JobState, QueuedJob, SENSITIVE_FIELDS};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::time::Duration;

/// Raw database row for a job.
#[derive(Debug, Clone, FromRow)]
struct JobRow {
    id: String,
    queue: String,
    payload: String,
    state: String,
    attempts_made: i64,
    run_at: String,
    last_error: Option<String>,
    result: Option<String>,
}

impl TryFrom<JobRow> for QueuedJob {
    type Error = ShellQueryError;

    fn try_from(row: JobRow) -> Result<Self> {
        let payload = serde_json::from_str(&row.payload).map_err(|e| {
            ShellQueryError::input(format!("Malformed payload for job '{}': {e}", row.id))
        })?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<JobResult>)
            .transpose()
            .map_err(|e| {
                ShellQueryError::persistence(format!("Malformed result for job '{}': {e}", row.id))
            })?;
        Ok(Self {
            job: Job::from_payload(&row.queue, payload)?,
            state: JobState::parse(&row.state),
            attempts_made: u32::try_from(row.attempts_made).unwrap_or(0),
            run_at: from_db_time(&row.run_at)?,
            last_error: row.last_error,
            result,
            id: row.id,
        })
    }
}

const JOB_COLUMNS: &str = "id, queue, payload, state, attempts_made, run_at, last_error, result";

fn due_at(delay: Duration) -> String {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    to_db_time(Utc::now() + delay)
}

fn payload_text(job: &Job) -> Result<String> {
    Ok(job.payload()?.to_string())
}

/// Inserts a job unless one with the same id exists.
pub async fn enqueue(pool: &SqlitePool, job: &Job, delay: Duration) -> Result<bool> {
    let state = if delay.is_zero() {
        JobState::Waiting
    } else {
        JobState::Delayed
    };
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (id, queue, payload, state, run_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(job.id())
    .bind(job.queue())
    .bind(payload_text(job)?)
    .bind(state.as_str())
    .bind(due_at(delay))
    .execute(pool)
    .await
    .map_err(|e| ShellQueryError::persistence(format!("Failed to enqueue job: {e}")))?;

    Ok(result.rows_affected() > 0)
}

pub async fn claim_next(pool: &SqlitePool) -> Result<Option<QueuedJob>> {
    let now = to_db_time(Utc::now());
    let sql = format!(
        r#"
        UPDATE jobs SET state = 'active', updated_at = datetime('now')
        WHERE id = (
            SELECT id FROM jobs
            WHERE state IN ('waiting', 'delayed') AND run_at <= ?
            ORDER BY run_at, created_at
            LIMIT 1
        )
        RETURNING {JOB_COLUMNS}
        "#
    );
    let row: Option<JobRow> = sqlx::query_as(&sql)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(|e| ShellQueryError::persistence(format!("Failed to claim job: {e}")))?;

    row.map(QueuedJob::try_from).transpose()
}

pub async fn get(pool: &SqlitePool, job_id: &str) -> Result<Option<QueuedJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
    let row: Option<JobRow> = sqlx::query_as(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| ShellQueryError::persistence(format!("Failed to get job '{job_id}': {e}")))?;

    row.map(QueuedJob::try_from).transpose()
}

async fn update(pool: &SqlitePool, sql: &str, job_id: &str, binds: &[Option<String>]) -> Result<()> {
    let mut query = sqlx::query(sql);
    for value in binds {
        query = query.bind(value.clone());
    }
    let result = query
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(|e| ShellQueryError::persistence(format!("Failed to update job '{job_id}': {e}")))?;
    if result.rows_affected() == 0 {
        return Err(ShellQueryError::persistence(format!("Job '{job_id}' not found")));
    }
    Ok(())
}

pub async fn complete(pool: &SqlitePool, job_id: &str, result: &JobResult) -> Result<()> {
    let result = serde_json::to_string(result)
        .map_err(|e| ShellQueryError::internal(format!("Failed to serialize job result: {e}")))?;
    update(
        pool,
        "UPDATE jobs SET state = 'completed', result = ?, updated_at = datetime('now') WHERE id = ?",
        job_id,
        &[Some(result)],
    )
    .await
}

pub async fn reschedule(pool: &SqlitePool, job: &Job, delay: Duration) -> Result<()> {
    update(
        pool,
        r#"
        UPDATE jobs SET state = 'delayed', payload = ?, run_at = ?, updated_at = datetime('now')
        WHERE id = ?
        "#,
        &job.id(),
        &[Some(payload_text(job)?), Some(due_at(delay))],
    )
    .await
}

pub async fn retry(pool: &SqlitePool, job_id: &str, error: &str, delay: Duration) -> Result<()> {
    update(
        pool,
        r#"
        UPDATE jobs SET state = 'delayed', attempts_made = attempts_made + 1,
            last_error = ?, run_at = ?, updated_at = datetime('now')
        WHERE id = ?
        "#,
        job_id,
        &[Some(error.to_string()), Some(due_at(delay))],
    )
    .await
}

pub async fn fail(pool: &SqlitePool, job_id: &str, error: &str) -> Result<()> {
    update(
        pool,
        r#"
        UPDATE jobs SET state = 'failed', attempts_made = attempts_made + 1,
            last_error = ?, updated_at = datetime('now')
        WHERE id = ?
        "#,
        job_id,
        &[Some(error.to_string())],
    )
    .await
}

/// Removes sensitive fields from a stored payload. A missing job is not an error.
pub async fn strip_sensitive_fields(pool: &SqlitePool, job_id: &str) -> Result<()> {
    let paths: Vec<String> = SENSITIVE_FIELDS.iter().map(|f| format!("'$.{f}'")).collect();
    let sql = format!(
        "UPDATE jobs SET payload = json_remove(payload, {}), updated_at = datetime('now') WHERE id = ?",
        paths.join(", ")
    );
    sqlx::query(&sql)
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(|e| {
            ShellQueryError::persistence(format!("Failed to strip job '{job_id}' payload: {e}"))
        })?;
    Ok(())
}

#[async_trait]
impl JobQueue for StateDb {
    async fn enqueue(&self, job: &Job, delay: Duration) -> Result<bool> {
        enqueue(self.pool(), job, delay).await
    }

    async fn claim_next(&self) -> Result<Option<QueuedJob>> {
        claim_next(self.pool()).await
    }

    async fn complete(&self, job_id: &str, result: &JobResult) -> Result<()> {
        complete(self.pool(), job_id, result).await
    }

    async fn reschedule(&self, job: &Job, delay: Duration) -> Result<()> {
        reschedule(self.pool(), job, delay).await
    }

    async fn retry(&self, job_id: &str, error: &str, delay: Duration) -> Result<()> {
        retry(self.pool(), job_id, error, delay).await
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        fail(self.pool(), job_id, error).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<QueuedJob>> {
        get(self.pool(), job_id).await
    }

    async fn strip_sensitive_fields(&self, job_id: &str) -> Result<()> {
        strip_sensitive_fields(self.pool(), job_id).await
    }
}

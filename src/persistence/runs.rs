//! Run record persistence.
//!
//! Status transitions are guarded in SQL so that a stale writer can never
//! move a run backwards or out of a terminal state.

use super::{from_db_time, to_db_time, StateDb};
use crate::error::{Result, ShellQueryError};
use crate::run::{Run, RunStatus, RunStore};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

/// Raw database row for a run.
#[derive(Debug, Clone, FromRow)]
struct RunRow {
    id: String,
    tenant_id: String,
    user_id: String,
    mid: String,
    status: String,
    task_id: Option<String>,
    query_definition_id: Option<String>,
    error_message: Option<String>,
    sql_text_hash: String,
    target_destination_key: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = ShellQueryError;

    fn try_from(row: RunRow) -> Result<Self> {
        let status = RunStatus::parse(&row.status).ok_or_else(|| {
            ShellQueryError::persistence(format!("Unknown run status '{}'", row.status))
        })?;
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            mid: row.mid,
            status,
            task_id: row.task_id,
            query_definition_id: row.query_definition_id,
            error_message: row.error_message,
            sql_text_hash: row.sql_text_hash,
            target_destination_key: row.target_destination_key,
            created_at: from_db_time(&row.created_at)?,
            updated_at: from_db_time(&row.updated_at)?,
            completed_at: row.completed_at.as_deref().map(from_db_time).transpose()?,
        })
    }
}

pub async fn create_run(pool: &SqlitePool, run: &Run) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs
        (id, tenant_id, user_id, mid, status, task_id, query_definition_id, error_message,
         sql_text_hash, target_destination_key, created_at, updated_at, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&run.id)
    .bind(&run.tenant_id)
    .bind(&run.user_id)
    .bind(&run.mid)
    .bind(run.status.as_str())
    .bind(&run.task_id)
    .bind(&run.query_definition_id)
    .bind(&run.error_message)
    .bind(&run.sql_text_hash)
    .bind(&run.target_destination_key)
    .bind(to_db_time(run.created_at))
    .bind(to_db_time(run.updated_at))
    .bind(run.completed_at.map(to_db_time))
    .execute(pool)
    .await
    .map_err(|e| ShellQueryError::persistence(format!("Failed to create run '{}': {e}", run.id)))?;
    Ok(())
}

pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<Run>> {
    let row: Option<RunRow> = sqlx::query_as(
        r#"
        SELECT id, tenant_id, user_id, mid, status, task_id, query_definition_id,
               error_message, sql_text_hash, target_destination_key,
               created_at, updated_at, completed_at
        FROM runs WHERE id = ?
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| ShellQueryError::persistence(format!("Failed to get run '{run_id}': {e}")))?;

    row.map(Run::try_from).transpose()
}

pub async fn mark_running(
    pool: &SqlitePool,
    run_id: &str,
    task_id: &str,
    query_definition_id: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = 'running', task_id = ?, query_definition_id = ?, updated_at = ?
        WHERE id = ? AND status IN ('queued', 'running')
        "#,
    )
    .bind(task_id)
    .bind(query_definition_id)
    .bind(to_db_time(Utc::now()))
    .bind(run_id)
    .execute(pool)
    .await
    .map_err(|e| ShellQueryError::persistence(format!("Failed to mark run running: {e}")))?;

    Ok(result.rows_affected() > 0)
}

/// Moves a non-terminal run to a terminal status.
async fn finish(
    pool: &SqlitePool,
    run_id: &str,
    status: RunStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    let now = to_db_time(Utc::now());
    let result = sqlx::query(
        r#"
        UPDATE runs
        SET status = ?, error_message = COALESCE(?, error_message),
            updated_at = ?, completed_at = ?
        WHERE id = ? AND status IN ('queued', 'running')
        "#,
    )
    .bind(status.as_str())
    .bind(error_message)
    .bind(&now)
    .bind(&now)
    .bind(run_id)
    .execute(pool)
    .await
    .map_err(|e| {
        ShellQueryError::persistence(format!("Failed to mark run {}: {e}", status.as_str()))
    })?;

    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl RunStore for StateDb {
    async fn create_run(&self, run: &Run) -> Result<()> {
        create_run(self.pool(), run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        get_run(self.pool(), run_id).await
    }

    async fn mark_running(
        &self,
        run_id: &str,
        task_id: &str,
        query_definition_id: &str,
    ) -> Result<bool> {
        mark_running(self.pool(), run_id, task_id, query_definition_id).await
    }

    async fn mark_ready(&self, run_id: &str) -> Result<bool> {
        finish(self.pool(), run_id, RunStatus::Ready, None).await
    }

    async fn mark_failed(&self, run_id: &str, error_message: &str) -> Result<bool> {
        finish(self.pool(), run_id, RunStatus::Failed, Some(error_message)).await
    }

    async fn mark_canceled(&self, run_id: &str) -> Result<bool> {
        finish(self.pool(), run_id, RunStatus::Canceled, None).await
    }
}

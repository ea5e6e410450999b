//! Schema versioning and migrations for the state database.
//!
//! Manages database schema evolution with forward-only migrations.

use crate::error::{Result, ShellQueryError};
use sqlx::sqlite::SqlitePool;
use tracing::info;

const CURRENT_VERSION: i32 = 2;

/// Runs all pending migrations on the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    ensure_schema_versions_table(pool).await?;

    let current = get_current_version(pool).await?;

    if current > CURRENT_VERSION {
        return Err(ShellQueryError::persistence(format!(
            "Database schema version ({}) is newer than supported version ({}). \
             Please upgrade shell-query to the latest version.",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        info!(
            "Migrating state database from version {} to {}",
            current, CURRENT_VERSION
        );
        run_pending_migrations(pool, current).await?;
    }

    Ok(())
}

async fn ensure_schema_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        ShellQueryError::persistence(format!("Failed to create schema_versions table: {e}"))
    })?;

    Ok(())
}

async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM schema_versions")
        .fetch_optional(pool)
        .await
        .map_err(|e| ShellQueryError::persistence(format!("Failed to get schema version: {e}")))?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

async fn run_pending_migrations(pool: &SqlitePool, from_version: i32) -> Result<()> {
    for version in (from_version + 1)..=CURRENT_VERSION {
        run_migration(pool, version).await?;
        record_version(pool, version).await?;
        info!("Applied migration v{}", version);
    }
    Ok(())
}

async fn record_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_versions (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| ShellQueryError::persistence(format!("Failed to record migration: {e}")))?;
    Ok(())
}

async fn run_migration(pool: &SqlitePool, version: i32) -> Result<()> {
    match version {
        1 => migration_v1(pool).await,
        2 => migration_v2(pool).await,
        _ => Err(ShellQueryError::persistence(format!(
            "Unknown migration version: {version}"
        ))),
    }
}

async fn execute(pool: &SqlitePool, sql: &str, what: &str) -> Result<()> {
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| ShellQueryError::persistence(format!("Failed to create {what}: {e}")))?;
    Ok(())
}

/// Migration v1: runs, tenant settings and the job queue.
async fn migration_v1(pool: &SqlitePool) -> Result<()> {
    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            mid TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('queued', 'running', 'ready', 'failed', 'canceled')),
            task_id TEXT,
            query_definition_id TEXT,
            error_message TEXT,
            sql_text_hash TEXT NOT NULL,
            target_destination_key TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
        "runs table",
    )
    .await?;

    execute(
        pool,
        "CREATE INDEX IF NOT EXISTS idx_runs_tenant ON runs(tenant_id, created_at)",
        "runs index",
    )
    .await?;

    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS tenant_settings (
            tenant_id TEXT NOT NULL,
            mid TEXT NOT NULL,
            results_folder_id INTEGER,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (tenant_id, mid)
        )
        "#,
        "tenant_settings table",
    )
    .await?;

    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL
                CHECK (state IN ('waiting', 'delayed', 'active', 'completed', 'failed')),
            attempts_made INTEGER NOT NULL DEFAULT 0,
            run_at TEXT NOT NULL,
            last_error TEXT,
            result TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
        "jobs table",
    )
    .await?;

    execute(
        pool,
        "CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, run_at)",
        "jobs index",
    )
    .await
}

/// Migration v2: status event log and latest-event cache.
async fn migration_v2(pool: &SqlitePool) -> Result<()> {
    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS status_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        "status_events table",
    )
    .await?;

    execute(
        pool,
        "CREATE INDEX IF NOT EXISTS idx_status_events_channel ON status_events(channel, id)",
        "status_events index",
    )
    .await?;

    execute(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS status_latest (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
        "status_latest table",
    )
    .await
}

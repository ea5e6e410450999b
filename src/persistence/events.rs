//! Status event log and latest-event cache.
//!
//! Events are stored exactly as published (ciphertext). Expired cache
//! entries are ignored on read and purged on write.

use super::{to_db_time, StateDb};
use crate::error::{Result, ShellQueryError};
use crate::status::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::time::Duration;

/// A published event as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredEvent {
    pub id: i64,
    pub channel: String,
    pub payload: String,
    pub created_at: String,
}

pub async fn publish(pool: &SqlitePool, channel: &str, payload: &str) -> Result<()> {
    sqlx::query("INSERT INTO status_events (channel, payload, created_at) VALUES (?, ?, ?)")
        .bind(channel)
        .bind(payload)
        .bind(to_db_time(Utc::now()))
        .execute(pool)
        .await
        .map_err(|e| ShellQueryError::persistence(format!("Failed to publish event: {e}")))?;
    Ok(())
}

/// Events on `channel` after `after_id`, oldest first.
pub async fn list_events(pool: &SqlitePool, channel: &str, after_id: i64) -> Result<Vec<StoredEvent>> {
    sqlx::query_as(
        r#"
        SELECT id, channel, payload, created_at FROM status_events
        WHERE channel = ? AND id > ?
        ORDER BY id
        "#,
    )
    .bind(channel)
    .bind(after_id)
    .fetch_all(pool)
    .await
    .map_err(|e| ShellQueryError::persistence(format!("Failed to list events: {e}")))
}

pub async fn set_with_ttl(pool: &SqlitePool, key: &str, value: &str, ttl: Duration) -> Result<()> {
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
    sqlx::query("DELETE FROM status_latest WHERE expires_at <= ?")
        .bind(to_db_time(now))
        .execute(pool)
        .await
        .map_err(|e| ShellQueryError::persistence(format!("Failed to purge cache: {e}")))?;
    sqlx::query(
        r#"
        INSERT INTO status_latest (key, value, expires_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(to_db_time(now + ttl))
    .execute(pool)
    .await
    .map_err(|e| ShellQueryError::persistence(format!("Failed to cache '{key}': {e}")))?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM status_latest WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(to_db_time(Utc::now()))
            .fetch_optional(pool)
            .await
            .map_err(|e| ShellQueryError::persistence(format!("Failed to read '{key}': {e}")))?;
    Ok(row.map(|(value,)| value))
}

impl StateDb {
    /// Events published on `channel` after `after_id`.
    pub async fn events(&self, channel: &str, after_id: i64) -> Result<Vec<StoredEvent>> {
        list_events(self.pool(), channel, after_id).await
    }
}

#[async_trait]
impl EventBus for StateDb {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        publish(self.pool(), channel, payload).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        set_with_ttl(self.pool(), key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        get(self.pool(), key).await
    }
}

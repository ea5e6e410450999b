//! Tenant settings persistence.

use super::StateDb;
use crate::error::{Result, ShellQueryError};
use crate::strategy::TenantSettingsStore;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;

pub async fn get_results_folder_id(
    pool: &SqlitePool,
    tenant_id: &str,
    mid: &str,
) -> Result<Option<i64>> {
    let row: Option<(Option<i64>,)> = sqlx::query_as(
        "SELECT results_folder_id FROM tenant_settings WHERE tenant_id = ? AND mid = ?",
    )
    .bind(tenant_id)
    .bind(mid)
    .fetch_optional(pool)
    .await
    .map_err(|e| ShellQueryError::persistence(format!("Failed to get tenant settings: {e}")))?;

    Ok(row.and_then(|(id,)| id))
}

/// Last writer wins.
pub async fn upsert_results_folder_id(
    pool: &SqlitePool,
    tenant_id: &str,
    mid: &str,
    folder_id: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tenant_settings (tenant_id, mid, results_folder_id, updated_at)
        VALUES (?, ?, ?, datetime('now'))
        ON CONFLICT(tenant_id, mid) DO UPDATE SET
            results_folder_id = excluded.results_folder_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(tenant_id)
    .bind(mid)
    .bind(folder_id)
    .execute(pool)
    .await
    .map_err(|e| ShellQueryError::persistence(format!("Failed to save tenant settings: {e}")))?;
    Ok(())
}

#[async_trait]
impl TenantSettingsStore for StateDb {
    async fn get_results_folder_id(&self, tenant_id: &str, mid: &str) -> Result<Option<i64>> {
        get_results_folder_id(self.pool(), tenant_id, mid).await
    }

    async fn upsert_results_folder_id(
        &self,
        tenant_id: &str,
        mid: &str,
        folder_id: i64,
    ) -> Result<()> {
        upsert_results_folder_id(self.pool(), tenant_id, mid, folder_id).await
    }
}

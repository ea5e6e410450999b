//! Tenant-scoped results folder.

use crate::engine::{EngineClient, EngineContext};
use crate::error::Result;
use async_trait::async_trait;
use tracing::{debug, info};

/// Per-tenant settings owned by the pipeline.
#[async_trait]
pub trait TenantSettingsStore: Send + Sync {
    async fn get_results_folder_id(&self, tenant_id: &str, mid: &str) -> Result<Option<i64>>;

    /// Stores the folder id for (tenant, mid); the last write wins.
    async fn upsert_results_folder_id(&self, tenant_id: &str, mid: &str, folder_id: i64)
        -> Result<()>;
}

/// Returns the folder generated artifacts are created in.
///
/// Uses the cached id when present; otherwise finds the folder by name or
/// creates it, then caches the id. Two runs racing on first use may both
/// create; whichever upsert lands last is kept.
pub async fn resolve_results_folder(
    engine: &dyn EngineClient,
    settings: &dyn TenantSettingsStore,
    ctx: &EngineContext,
    folder_name: &str,
) -> Result<i64> {
    if let Some(id) = settings
        .get_results_folder_id(&ctx.tenant_id, &ctx.mid)
        .await?
    {
        debug!(folder_id = id, "Using cached results folder");
        return Ok(id);
    }

    let folder = match engine.find_folder(ctx, folder_name).await? {
        Some(folder) => folder,
        None => {
            info!(tenant_id = %ctx.tenant_id, mid = %ctx.mid, "Creating results folder");
            engine.create_folder(ctx, folder_name).await?
        }
    };
    settings
        .upsert_results_folder_id(&ctx.tenant_id, &ctx.mid, folder.id)
        .await?;
    Ok(folder.id)
}

//! Execution strategies: validate, expand, provision and dispatch a query.
//!
//! Both variants share one pipeline and differ only in where results land:
//! [`ExecutionStrategy::RunToTemp`] creates a short-lived destination shaped
//! like the query output, [`ExecutionStrategy::RunToTarget`] writes into an
//! existing destination after checking the query fits it.

mod folder;
mod target;
mod temp;

pub use folder::{resolve_results_folder, TenantSettingsStore};
pub use target::{check_compatibility, check_self_overwrite};

use crate::config::ResultsConfig;
use crate::engine::{Destination, EngineClient, EngineContext, NewQueryDefinition, UpdateType};
use crate::error::Result;
use crate::jobs::ExecuteJob;
use crate::metadata::{normalize_table_name, FieldDefinition, MetadataFetcher};
use crate::sql::QueryAnalyzer;
use crate::status::{StatusKind, StatusReporter};
use crate::validator::QueryValidator;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Longest customer key the engine accepts.
pub const MAX_CUSTOMER_KEY_LENGTH: usize = 36;

fn artifact_key(prefix: &str, run_id: &str) -> String {
    let compact: String = run_id.chars().filter(|c| *c != '-').collect();
    format!("{prefix}{compact}")
        .chars()
        .take(MAX_CUSTOMER_KEY_LENGTH)
        .collect()
}

/// Customer key of the query definition created for a run.
pub fn query_customer_key(run_id: &str) -> String {
    artifact_key("SQ_", run_id)
}

/// Customer key (and name) of a run's temporary destination.
pub fn temp_destination_key(run_id: &str) -> String {
    artifact_key("SQR_", run_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Ready,
}

/// A dispatched query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    pub status: FlowStatus,
    pub task_id: String,
    pub query_definition_id: String,
    pub query_customer_key: String,
    /// Customer key of the destination the query writes to.
    pub destination_key: String,
}

/// Field lookup preferring metadata shipped with the job over a live call.
pub struct JobMetadataFetcher<'a> {
    supplied: HashMap<String, &'a Vec<FieldDefinition>>,
    engine: &'a dyn EngineClient,
    ctx: &'a EngineContext,
}

impl<'a> JobMetadataFetcher<'a> {
    pub fn new(
        supplied: Option<&'a HashMap<String, Vec<FieldDefinition>>>,
        engine: &'a dyn EngineClient,
        ctx: &'a EngineContext,
    ) -> Self {
        let supplied = supplied
            .into_iter()
            .flatten()
            .map(|(table, fields)| (normalize_table_name(table).to_lowercase(), fields))
            .collect();
        Self {
            supplied,
            engine,
            ctx,
        }
    }
}

#[async_trait]
impl MetadataFetcher for JobMetadataFetcher<'_> {
    async fn get_fields_for_table(&self, table: &str) -> Result<Option<Vec<FieldDefinition>>> {
        let key = normalize_table_name(table).to_lowercase();
        if let Some(fields) = self.supplied.get(&key) {
            return Ok(Some((*fields).clone()));
        }
        debug!(table, "Fetching table metadata from engine");
        self.engine.get_destination_fields(self.ctx, table).await
    }
}

/// Collaborators the strategies run against.
#[derive(Clone, Copy)]
pub struct StrategyContext<'a> {
    pub engine: &'a dyn EngineClient,
    pub settings: &'a dyn TenantSettingsStore,
    pub results: &'a ResultsConfig,
}

enum Prepared {
    Temp(Vec<FieldDefinition>),
    Target(Destination),
}

/// Where a run's results are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStrategy {
    RunToTemp,
    RunToTarget { destination_key: String },
}

impl ExecutionStrategy {
    /// Writes to the job's target destination if it names one.
    pub fn for_job(job: &ExecuteJob) -> Self {
        match job
            .target_destination_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
        {
            Some(key) => Self::RunToTarget {
                destination_key: key.to_string(),
            },
            None => Self::RunToTemp,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RunToTemp => "run-to-temp",
            Self::RunToTarget { .. } => "run-to-target",
        }
    }

    /// Runs the pipeline for `job` with its decrypted `sql`.
    pub async fn execute(
        &self,
        cx: StrategyContext<'_>,
        job: &ExecuteJob,
        sql: &str,
        status: StatusReporter<'_>,
    ) -> Result<FlowResult> {
        let ctx = job.engine_context();
        let fetcher = JobMetadataFetcher::new(job.table_metadata.as_ref(), cx.engine, &ctx);
        let validator = QueryValidator::new(cx.engine);

        status.checkpoint(StatusKind::ValidatingQuery).await;
        validator.validate(&ctx, sql).await?.into_result()?;

        let analyzer = QueryAnalyzer::new();
        let (sql, expanded) = if analyzer.contains_select_star(sql) {
            let rewritten = analyzer.expand_select_star(sql, &fetcher).await?;
            debug!(run_id = %job.run_id, "Expanded SELECT *");
            let changed = rewritten != sql;
            (rewritten, changed)
        } else {
            (sql.to_string(), false)
        };

        let prepared = match self {
            Self::RunToTemp => Prepared::Temp(temp::prepare(&sql, &fetcher, status).await?),
            Self::RunToTarget { destination_key } => Prepared::Target(
                target::prepare(
                    cx.engine,
                    &ctx,
                    destination_key,
                    &sql,
                    expanded,
                    &fetcher,
                    status,
                )
                .await?,
            ),
        };

        let folder_id =
            resolve_results_folder(cx.engine, cx.settings, &ctx, &cx.results.folder_name).await?;

        let query_key = query_customer_key(&job.run_id);
        remove_stale_query_definition(cx.engine, &ctx, &query_key).await;

        let destination = match prepared {
            Prepared::Temp(fields) => {
                temp::create_destination(cx, &ctx, &job.run_id, folder_id, fields).await?
            }
            Prepared::Target(destination) => destination,
        };

        status.checkpoint(StatusKind::ExecutingQuery).await;
        let definition = cx
            .engine
            .create_query_definition(
                &ctx,
                &NewQueryDefinition {
                    name: query_key.clone(),
                    customer_key: query_key.clone(),
                    folder_id,
                    sql,
                    target_key: destination.customer_key.clone(),
                    target_name: destination.name.clone(),
                    update_type: UpdateType::Overwrite,
                },
            )
            .await?;
        let task_id = cx
            .engine
            .perform_query_definition(&ctx, &definition.id)
            .await?;

        info!(
            run_id = %job.run_id,
            task_id = %task_id,
            strategy = self.name(),
            destination = %destination.customer_key,
            "Query dispatched"
        );
        Ok(FlowResult {
            status: FlowStatus::Ready,
            task_id,
            query_definition_id: definition.id,
            query_customer_key: query_key,
            destination_key: destination.customer_key,
        })
    }
}

/// Deletes a leftover query definition holding `customer_key`. Failures are
/// logged; a real conflict surfaces when the definition is created.
async fn remove_stale_query_definition(
    engine: &dyn EngineClient,
    ctx: &EngineContext,
    customer_key: &str,
) {
    match engine.find_query_definition(ctx, customer_key).await {
        Ok(Some(stale)) => {
            if let Err(e) = engine.delete_query_definition(ctx, &stale.id).await {
                warn!(customer_key, "Failed to delete stale query definition: {e}");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(customer_key, "Failed to look up stale query definition: {e}"),
    }
}

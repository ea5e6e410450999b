//! Results into a temporary destination shaped like the query output.

use super::{temp_destination_key, StrategyContext};
use crate::engine::{Destination, EngineContext, NewDestination};
use crate::error::Result;
use crate::metadata::{FieldDefinition, InferredField, MetadataFetcher};
use crate::sql::SchemaInferrer;
use crate::status::{StatusKind, StatusReporter};
use tracing::{debug, warn};

/// Infers the output schema the temporary destination is created with.
pub(super) async fn prepare(
    sql: &str,
    fetcher: &dyn MetadataFetcher,
    status: StatusReporter<'_>,
) -> Result<Vec<FieldDefinition>> {
    status.checkpoint(StatusKind::CreatingDataExtension).await;
    let inferred = SchemaInferrer::new().infer_schema(sql, fetcher).await?;
    debug!(columns = inferred.len(), "Inferred output schema");
    Ok(destination_fields(inferred))
}

/// Field definitions for the inferred columns, in order. Ad-hoc result sets
/// have no reliable key, so no field is a primary key.
pub(super) fn destination_fields(inferred: Vec<InferredField>) -> Vec<FieldDefinition> {
    inferred
        .into_iter()
        .map(|column| FieldDefinition {
            name: column.name,
            field_type: column.field_type,
            max_length: column.max_length,
            scale: column.scale,
            precision: column.precision,
            is_required: false,
            is_primary_key: false,
        })
        .collect()
}

/// Replaces any leftover destination for the run and creates a fresh one
/// with retention set so the engine expires it on its own.
pub(super) async fn create_destination(
    cx: StrategyContext<'_>,
    ctx: &EngineContext,
    run_id: &str,
    folder_id: i64,
    fields: Vec<FieldDefinition>,
) -> Result<Destination> {
    let key = temp_destination_key(run_id);
    if let Err(e) = cx.engine.delete_destination(ctx, &key).await {
        warn!(run_id, customer_key = %key, "Failed to delete stale destination: {e}");
    }

    cx.engine
        .create_destination(
            ctx,
            &NewDestination {
                name: key.clone(),
                customer_key: key,
                folder_id,
                fields,
                retention_days: Some(cx.results.temp_retention_days),
            },
        )
        .await
}

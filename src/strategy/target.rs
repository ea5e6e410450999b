//! Results into an existing destination.

use crate::engine::{Destination, EngineClient, EngineContext};
use crate::error::{Result, ShellQueryError};
use crate::metadata::{normalize_table_name, InferredField, MetadataFetcher};
use crate::sql::{QueryAnalyzer, SchemaInferrer};
use crate::status::{StatusKind, StatusReporter};
use crate::validator::QueryValidator;
use std::collections::HashSet;
use tracing::debug;

/// Resolves the target and checks the query can write into it. Nothing on
/// the engine is modified.
pub(super) async fn prepare(
    engine: &dyn EngineClient,
    ctx: &EngineContext,
    destination_key: &str,
    sql: &str,
    expanded: bool,
    fetcher: &dyn MetadataFetcher,
    status: StatusReporter<'_>,
) -> Result<Destination> {
    status.checkpoint(StatusKind::TargetingDataExtension).await;

    if expanded {
        QueryValidator::new(engine)
            .validate(ctx, sql)
            .await?
            .into_result()?;
    }

    let destination = engine
        .get_destination(ctx, destination_key)
        .await?
        .ok_or_else(|| {
            ShellQueryError::not_found(format!(
                "Target data extension '{destination_key}' not found"
            ))
        })?;

    check_self_overwrite(sql, &destination)?;

    let columns = SchemaInferrer::new().infer_columns(sql, fetcher).await?;
    let violations = check_compatibility(&columns, &destination);
    if !violations.is_empty() {
        return Err(ShellQueryError::validation(
            format!(
                "Query output does not match target data extension '{}'",
                destination.name
            ),
            violations,
        ));
    }
    debug!(
        destination = %destination.customer_key,
        columns = columns.len(),
        "Target data extension accepted query"
    );
    Ok(destination)
}

fn normalized(name: &str) -> String {
    normalize_table_name(name).to_lowercase()
}

/// Rejects a query that reads from the destination it overwrites: the
/// destination is cleared before the query runs, so it would see no rows.
pub fn check_self_overwrite(sql: &str, destination: &Destination) -> Result<()> {
    let name = normalized(&destination.name);
    let key = normalized(&destination.customer_key);
    let reads_target = QueryAnalyzer::new()
        .extract_table_names(sql)
        .iter()
        .map(|table| normalized(table))
        .any(|table| table == name || table == key);
    if reads_target {
        return Err(ShellQueryError::bad_request(format!(
            "Query reads from target data extension '{}' and cannot overwrite it",
            destination.name
        )));
    }
    Ok(())
}

/// Lists every way `columns` fail to fit `destination`.
pub fn check_compatibility(columns: &[InferredField], destination: &Destination) -> Vec<String> {
    let mut violations = Vec::new();

    let mut seen = HashSet::new();
    for column in columns {
        if !seen.insert(column.name.to_lowercase()) {
            violations.push(format!("Duplicate column name '{}' in query output", column.name));
        }
    }

    for column in columns {
        let exists = destination
            .fields
            .iter()
            .any(|f| f.name.eq_ignore_ascii_case(&column.name));
        if !exists {
            violations.push(format!(
                "Column '{}' does not exist on target data extension '{}'",
                column.name, destination.name
            ));
        }
    }

    for field in destination.fields.iter().filter(|f| f.is_required) {
        if !seen.contains(&field.name.to_lowercase()) {
            violations.push(format!(
                "Required field '{}' on target data extension '{}' is not populated by the query",
                field.name, destination.name
            ));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldDefinition, FieldType};
    use pretty_assertions::assert_eq;

    fn destination() -> Destination {
        Destination {
            customer_key: "target_key".to_string(),
            name: "Master Subscribers".to_string(),
            fields: vec![
                FieldDefinition::text("SubscriberKey", 254).primary_key(),
                FieldDefinition::text("Email", 254).required(),
                FieldDefinition::new("Score", FieldType::Number),
            ],
        }
    }

    #[test]
    fn test_self_overwrite_by_name_is_rejected() {
        let err = check_self_overwrite(
            "SELECT SubscriberKey FROM [master subscribers]",
            &destination(),
        )
        .unwrap_err();
        assert!(matches!(err, ShellQueryError::BadRequest(_)));
    }

    #[test]
    fn test_self_overwrite_by_key_in_join_is_rejected() {
        let sql = "SELECT s.SubscriberKey FROM _Subscribers s \
                   JOIN ENT.[TARGET_KEY] t ON t.SubscriberKey = s.SubscriberKey";
        assert!(check_self_overwrite(sql, &destination()).is_err());
    }

    #[test]
    fn test_reading_other_tables_is_allowed() {
        assert!(check_self_overwrite("SELECT Email FROM Customers", &destination()).is_ok());
    }

    #[test]
    fn test_compatible_columns() {
        let columns = vec![
            InferredField::default_text("subscriberkey"),
            InferredField::default_text("Email"),
        ];
        assert!(check_compatibility(&columns, &destination()).is_empty());
    }

    #[test]
    fn test_all_violations_are_reported() {
        let columns = vec![
            InferredField::default_text("SubscriberKey"),
            InferredField::default_text("Phone"),
            InferredField::default_text("subscriberKey"),
        ];
        assert_eq!(
            check_compatibility(&columns, &destination()),
            vec![
                "Duplicate column name 'subscriberKey' in query output".to_string(),
                "Column 'Phone' does not exist on target data extension 'Master Subscribers'"
                    .to_string(),
                "Required field 'Email' on target data extension 'Master Subscribers' is not populated by the query"
                    .to_string(),
            ]
        );
    }
}

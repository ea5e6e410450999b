//! Wildcard expansion feeding schema inference, with metadata resolved the
//! way the execute job resolves it.

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use shell_query::engine::{Destination, EngineContext, MockEngineClient};
use shell_query::error::ShellQueryError;
use shell_query::metadata::{FieldDefinition, FieldType, InferredField};
use shell_query::sql::{QueryAnalyzer, SchemaInferrer};
use shell_query::strategy::JobMetadataFetcher;

fn ctx() -> EngineContext {
    EngineContext {
        tenant_id: "tenant".to_string(),
        user_id: "user".to_string(),
        mid: "100".to_string(),
        eid: None,
    }
}

fn orders() -> Destination {
    Destination {
        customer_key: "orders".to_string(),
        name: "Orders".to_string(),
        fields: vec![
            FieldDefinition::text("OrderId", 36),
            FieldDefinition::text("SubscriberKey", 254),
            FieldDefinition {
                scale: Some(2),
                precision: Some(12),
                ..FieldDefinition::new("Amount", FieldType::Decimal)
            },
        ],
    }
}

fn supplied() -> HashMap<String, Vec<FieldDefinition>> {
    HashMap::from([(
        "[Customers]".to_string(),
        vec![
            FieldDefinition::text("SubscriberKey", 254),
            FieldDefinition::new("Email", FieldType::EmailAddress).with_max_length(254),
        ],
    )])
}

#[tokio::test]
async fn test_expand_then_infer_joined_tables() {
    let engine = MockEngineClient::new().with_destination(orders());
    let metadata = supplied();
    let ctx = ctx();
    let fetcher = JobMetadataFetcher::new(Some(&metadata), &engine, &ctx);

    let sql = "SELECT c.*, o.Amount FROM Customers c JOIN Orders o ON o.SubscriberKey = c.SubscriberKey";
    let expanded = QueryAnalyzer::new()
        .expand_select_star(sql, &fetcher)
        .await
        .unwrap();
    assert!(!QueryAnalyzer::new().contains_select_star(&expanded), "{expanded}");

    let fields = SchemaInferrer::new()
        .infer_schema(&expanded, &fetcher)
        .await
        .unwrap();
    assert_eq!(
        fields,
        vec![
            InferredField::new("SubscriberKey", FieldType::Text).with_max_length(254),
            InferredField::new("Email", FieldType::EmailAddress).with_max_length(254),
            InferredField::new("Amount", FieldType::Decimal).with_decimal(2, 12),
        ]
    );

    // Supplied metadata wins; only Orders is looked up remotely.
    assert_eq!(engine.count("get_destination_fields"), 1);
}

#[tokio::test]
async fn test_ambiguous_star_is_rejected() {
    let engine = MockEngineClient::new().with_destination(orders());
    let metadata = supplied();
    let ctx = ctx();
    let fetcher = JobMetadataFetcher::new(Some(&metadata), &engine, &ctx);

    let err = QueryAnalyzer::new()
        .expand_select_star(
            "SELECT * FROM Customers c JOIN Orders o ON o.SubscriberKey = c.SubscriberKey",
            &fetcher,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ShellQueryError::SelectStarExpansionFailed(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_output_names_are_made_engine_safe() {
    let engine = MockEngineClient::new();
    let ctx = ctx();
    let fetcher = JobMetadataFetcher::new(None, &engine, &ctx);

    let long = "A".repeat(60);
    let sql = format!(
        "SELECT COUNT(*) AS {long}, 1 AS {prefix}, SUM(1) AS Total, AVG(2) AS total FROM _Sent",
        prefix = "A".repeat(45)
    );
    let fields = SchemaInferrer::new().infer_schema(&sql, &fetcher).await.unwrap();
    let names: Vec<_> = fields.iter().map(|f| f.name.clone()).collect();
    assert_eq!(
        names,
        vec![
            "A".repeat(45),
            format!("{}_1", "A".repeat(45)),
            "Total".to_string(),
            "total_1".to_string(),
        ]
    );
    assert_eq!(fields[3].field_type, FieldType::Decimal);

    // _Sent is a built-in view, never fetched.
    assert_eq!(engine.count("get_destination_fields"), 0);
}

//! Runs that write into an existing destination.

use pretty_assertions::assert_eq;
use shell_query::engine::{Destination, EngineCall, MockEngineClient};
use shell_query::jobs::{execute_job_id, JobQueue, JobState};
use shell_query::metadata::{FieldDefinition, FieldType};
use shell_query::run::{RunStatus, RunStore};
use shell_query::status::StatusKind;

use super::common::pipeline;

fn contacts() -> Destination {
    Destination {
        customer_key: "Contacts_Key".to_string(),
        name: "Contacts".to_string(),
        fields: vec![
            FieldDefinition::text("SubscriberKey", 254).primary_key(),
            FieldDefinition::new("Email", FieldType::EmailAddress).with_max_length(254),
            FieldDefinition::new("Score", FieldType::Number),
        ],
    }
}

fn customers() -> Destination {
    Destination {
        customer_key: "Customers_Key".to_string(),
        name: "Customers".to_string(),
        fields: vec![
            FieldDefinition::text("Id", 50),
            FieldDefinition::new("Email", FieldType::EmailAddress).with_max_length(254),
        ],
    }
}

fn leads() -> Destination {
    Destination {
        customer_key: "Leads_Key".to_string(),
        name: "Leads".to_string(),
        fields: vec![
            FieldDefinition::text("SubscriberKey", 254).primary_key(),
            FieldDefinition::new("Email", FieldType::EmailAddress).with_max_length(254),
        ],
    }
}

fn engine() -> MockEngineClient {
    MockEngineClient::new()
        .with_destination(contacts())
        .with_destination(customers())
        .with_destination(leads())
}

#[tokio::test]
async fn test_target_run_writes_into_existing_destination() {
    let p = pipeline(engine());
    p.submit(
        "run1",
        "SELECT Id AS SubscriberKey, Email FROM Customers",
        Some("Contacts_Key"),
    )
    .await;

    p.drain().await;

    assert_eq!(
        p.runs.get_run("run1").await.unwrap().unwrap().status,
        RunStatus::Ready
    );
    assert_eq!(p.engine.count("create_destination"), 0);
    let target = p
        .engine
        .calls()
        .into_iter()
        .find_map(|call| match call {
            EngineCall::CreateQueryDefinition { target_key, .. } => Some(target_key),
            _ => None,
        })
        .unwrap();
    assert_eq!(target, "Contacts_Key");
    assert!(p.statuses("run1").contains(&StatusKind::TargetingDataExtension));
    assert!(!p.statuses("run1").contains(&StatusKind::CreatingDataExtension));
    // Unexpanded SQL is validated once.
    assert_eq!(p.engine.count("validate_query"), 1);
}

#[tokio::test]
async fn test_expanded_target_query_is_validated_again() {
    let p = pipeline(engine());
    p.submit("run1", "SELECT * FROM Leads", Some("Contacts_Key")).await;

    p.drain().await;

    assert_eq!(
        p.runs.get_run("run1").await.unwrap().unwrap().status,
        RunStatus::Ready
    );
    assert_eq!(p.engine.count("validate_query"), 2);
    let validated: Vec<_> = p
        .engine
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            EngineCall::ValidateQuery { sql } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(validated[0], "SELECT * FROM Leads");
    assert!(!validated[1].contains('*'), "{}", validated[1]);
}

#[tokio::test]
async fn test_self_overwrite_is_rejected_before_dispatch() {
    let p = pipeline(engine());
    p.submit(
        "run1",
        "SELECT c.SubscriberKey, c.Email FROM Contacts c",
        Some("Contacts_Key"),
    )
    .await;

    p.drain().await;

    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("Contacts"));
    assert_eq!(p.engine.count("create_query_definition"), 0);
    assert_eq!(p.engine.count("perform_query_definition"), 0);

    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    assert_eq!(execute.state, JobState::Failed);
    assert_eq!(execute.attempts_made, 1);
}

#[tokio::test]
async fn test_incompatible_columns_are_all_reported() {
    let p = pipeline(engine());
    p.submit(
        "run1",
        "SELECT Email, Email AS email, Id AS Nickname FROM Customers",
        Some("Contacts_Key"),
    )
    .await;

    p.drain().await;

    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    let message = run.error_message.unwrap();
    assert!(message.contains("Duplicate column name 'email'"), "{message}");
    assert!(
        message.contains("Column 'Nickname' does not exist on target data extension 'Contacts'"),
        "{message}"
    );
    assert!(
        message.contains("Required field 'SubscriberKey'"),
        "{message}"
    );
    assert_eq!(p.engine.count("create_query_definition"), 0);
}

#[tokio::test]
async fn test_missing_target_is_not_found() {
    let p = pipeline(engine());
    p.submit("run1", "SELECT Email FROM Customers", Some("Nope")).await;

    p.drain().await;

    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.error_message.as_deref(),
        Some("Target data extension 'Nope' not found")
    );
}

#[tokio::test]
async fn test_blank_target_runs_to_temp() {
    let p = pipeline(engine());
    p.submit("run1", "SELECT Email FROM Customers", Some("   ")).await;

    p.drain().await;

    assert_eq!(p.engine.count("create_destination"), 1);
    assert_eq!(
        p.runs.get_run("run1").await.unwrap().unwrap().status,
        RunStatus::Ready
    );
}

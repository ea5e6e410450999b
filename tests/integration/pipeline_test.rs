//! Execute and poll jobs carried through the worker to a terminal run state.

use std::collections::HashMap;
use std::time::Duration;

use pretty_assertions::assert_eq;
use shell_query::engine::{AsyncStatus, EngineCall, MockEngineClient, TaskStatus, ValidationResult};
use shell_query::error::ShellQueryError;
use shell_query::jobs::{execute_job_id, poll_job_id, ExecuteJob, Job, JobQueue, JobResult, JobState};
use shell_query::metadata::{FieldDefinition, FieldType};
use shell_query::processor::{JobContext, Outcome};
use shell_query::run::{Run, RunStatus, RunStore};
use shell_query::status::StatusKind;

use super::common::{pipeline, pipeline_with, polling_config};

fn customers() -> HashMap<String, Vec<FieldDefinition>> {
    HashMap::from([(
        "Customers".to_string(),
        vec![
            FieldDefinition::text("SubscriberKey", 254).primary_key(),
            FieldDefinition::new("Email", FieldType::EmailAddress).with_max_length(254),
            FieldDefinition::new("Age", FieldType::Number),
        ],
    )])
}

#[tokio::test]
async fn test_temp_run_completes() {
    let p = pipeline(MockEngineClient::new());
    p.submit_with_metadata(
        "run1",
        "SELECT Email, COUNT(*) AS Total FROM Customers GROUP BY Email",
        None,
        Some(customers()),
    )
    .await;

    p.drain().await;

    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Ready);
    assert!(run.completed_at.is_some());
    assert_eq!(
        p.statuses("run1"),
        vec![
            StatusKind::Queued,
            StatusKind::ValidatingQuery,
            StatusKind::CreatingDataExtension,
            StatusKind::ExecutingQuery,
            StatusKind::FetchingResults,
            StatusKind::Ready,
        ]
    );

    let created = p
        .engine
        .calls()
        .into_iter()
        .find_map(|call| match call {
            EngineCall::CreateDestination {
                customer_key,
                fields,
            } => Some((customer_key, fields)),
            _ => None,
        })
        .unwrap();
    assert_eq!(created.0, "SQR_run1");
    let names: Vec<_> = created.1.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["Email", "Total"]);
    assert_eq!(created.1[1].field_type, FieldType::Number);
    assert!(created.1.iter().all(|f| !f.is_primary_key));

    let latest = p.publisher.latest("run1").await.unwrap().unwrap();
    assert_eq!(latest.status, StatusKind::Ready);

    // Encrypted SQL does not outlive the run.
    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    let Job::Execute(job) = execute.job else {
        panic!("expected an execute job");
    };
    assert!(job.sql_text.is_empty());
    assert!(job.table_metadata.is_none());

    let poll = p.queue.get(&poll_job_id("run1")).await.unwrap().unwrap();
    assert_eq!(poll.state, JobState::Completed);
    assert_eq!(
        poll.result,
        Some(JobResult::Ready {
            run_id: "run1".to_string()
        })
    );
}

#[tokio::test]
async fn test_select_star_is_expanded_before_dispatch() {
    let p = pipeline(MockEngineClient::new());
    p.submit_with_metadata("run1", "SELECT * FROM Customers", None, Some(customers()))
        .await;

    p.drain().await;

    let sql = p
        .engine
        .calls()
        .into_iter()
        .find_map(|call| match call {
            EngineCall::CreateQueryDefinition { sql, .. } => Some(sql),
            _ => None,
        })
        .unwrap();
    assert!(!sql.contains('*'), "{sql}");
    assert!(sql.contains("SubscriberKey"));
    assert!(sql.contains("Email"));
    assert_eq!(
        p.runs.get_run("run1").await.unwrap().unwrap().status,
        RunStatus::Ready
    );
}

#[tokio::test]
async fn test_pending_task_is_polled_again() {
    let engine = MockEngineClient::new();
    engine.push_task_status(TaskStatus::new(AsyncStatus::Queued));
    engine.push_task_status(TaskStatus::new(AsyncStatus::Processing));
    let p = pipeline(engine);
    p.submit("run1", "SELECT 1 AS One", None).await;

    p.drain().await;

    assert_eq!(p.engine.count("get_task_status"), 3);
    assert_eq!(
        p.runs.get_run("run1").await.unwrap().unwrap().status,
        RunStatus::Ready
    );
}

#[tokio::test]
async fn test_remote_task_error_fails_run_and_cleans_up() {
    let engine = MockEngineClient::new();
    engine.push_task_status(TaskStatus {
        status: AsyncStatus::Error,
        error_message: Some("Invalid column name 'Emial'".to_string()),
    });
    let p = pipeline(engine);
    p.submit_with_metadata("run1", "SELECT Email FROM Customers", None, Some(customers()))
        .await;

    p.drain().await;

    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("Invalid column name 'Emial'"));
    assert_eq!(p.engine.count("delete_query_definition"), 1);

    let last = p.events("run1").pop().unwrap();
    assert_eq!(last.status, StatusKind::Failed);
    assert_eq!(last.error_message.as_deref(), Some("Invalid column name 'Emial'"));

    // A failed run keeps its payload for diagnosis.
    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    let Job::Execute(job) = execute.job else {
        panic!("expected an execute job");
    };
    assert!(!job.sql_text.is_empty());
    assert_eq!(job.table_metadata, Some(customers()));
}

#[tokio::test]
async fn test_cancel_before_execution_never_dispatches() {
    let p = pipeline(MockEngineClient::new());
    p.submit("run1", "SELECT 1 AS One", None).await;
    assert!(p.runs.mark_canceled("run1").await.unwrap());

    p.drain().await;

    assert_eq!(p.engine.count("create_query_definition"), 0);
    assert_eq!(p.engine.count("perform_query_definition"), 0);
    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    assert_eq!(
        execute.result,
        Some(JobResult::Canceled {
            run_id: "run1".to_string()
        })
    );
    assert!(p.queue.get(&poll_job_id("run1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_while_polling_removes_query_definition() {
    let engine = MockEngineClient::new();
    engine.set_default_task_status(TaskStatus::new(AsyncStatus::Processing));
    let p = pipeline(engine);
    p.submit("run1", "SELECT 1 AS One", None).await;

    // Execute, then one pending poll.
    p.worker.run_next_job().await.unwrap();
    p.queue.release_delayed();
    p.worker.run_next_job().await.unwrap();
    assert!(p.runs.mark_canceled("run1").await.unwrap());

    p.drain().await;

    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(p.engine.count("delete_query_definition"), 1);
    assert_eq!(p.statuses("run1").last(), Some(&StatusKind::Canceled));
    assert_eq!(
        p.publisher.latest("run1").await.unwrap().unwrap().status,
        StatusKind::Canceled
    );
}

#[tokio::test]
async fn test_timeout_fails_run() {
    let engine = MockEngineClient::new();
    engine.set_default_task_status(TaskStatus::new(AsyncStatus::Processing));
    let p = pipeline_with(
        engine,
        shell_query::config::PollingConfig {
            max_duration_secs: 0,
            ..polling_config()
        },
    );
    p.submit("run1", "SELECT 1 AS One", None).await;
    p.worker.run_next_job().await.unwrap();

    // Let the poll's clock pass the zero-second limit.
    tokio::time::sleep(Duration::from_millis(5)).await;
    p.drain().await;

    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Query timed out after"));
    let poll = p.queue.get(&poll_job_id("run1")).await.unwrap().unwrap();
    assert_eq!(
        poll.result,
        Some(JobResult::Timeout {
            run_id: "run1".to_string()
        })
    );
    assert_eq!(p.engine.count("delete_query_definition"), 1);
}

#[tokio::test]
async fn test_invalid_query_fails_on_first_attempt() {
    let engine = MockEngineClient::new();
    engine.push_validation(ValidationResult::invalid(vec![
        "Incorrect syntax near 'FORM'".to_string(),
    ]));
    let p = pipeline(engine);
    p.submit("run1", "SELECT Email FORM Customers", None).await;

    p.drain().await;

    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .error_message
        .as_deref()
        .unwrap()
        .contains("Incorrect syntax near 'FORM'"));
    assert_eq!(p.engine.count("create_query_definition"), 0);

    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    assert_eq!(execute.state, JobState::Failed);
    assert_eq!(execute.attempts_made, 1);
}

#[tokio::test]
async fn test_undecryptable_payload_is_terminal() {
    let p = pipeline(MockEngineClient::new());
    p.runs
        .create_run(&Run::new("run1", "tenant", "user", "100", "hash"))
        .await
        .unwrap();
    p.queue
        .enqueue(
            &Job::Execute(ExecuteJob {
                run_id: "run1".to_string(),
                tenant_id: "tenant".to_string(),
                user_id: "user".to_string(),
                mid: "100".to_string(),
                eid: None,
                sql_text: "not-a-ciphertext".to_string(),
                table_metadata: None,
                target_destination_key: None,
            }),
            Duration::ZERO,
        )
        .await
        .unwrap();

    p.drain().await;

    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    assert_eq!(execute.state, JobState::Failed);
    assert_eq!(execute.attempts_made, 1);
    assert_eq!(p.engine.count("validate_query"), 0);
    assert_eq!(
        p.runs.get_run("run1").await.unwrap().unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried_to_success() {
    let engine = MockEngineClient::new();
    engine.fail_next(
        "create_query_definition",
        ShellQueryError::upstream(Some(503), "Service unavailable"),
    );
    let p = pipeline(engine);
    p.submit("run1", "SELECT 1 AS One", None).await;

    p.drain().await;

    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    assert_eq!(execute.state, JobState::Completed);
    assert_eq!(execute.attempts_made, 1);
    assert_eq!(execute.last_error.as_deref(), Some("Upstream error: Service unavailable"));
    assert_eq!(
        p.runs.get_run("run1").await.unwrap().unwrap().status,
        RunStatus::Ready
    );
    assert_eq!(p.engine.destination_keys(), ["SQR_run1"]);
}

#[tokio::test]
async fn test_retries_exhausted_fail_run() {
    let engine = MockEngineClient::new();
    for _ in 0..3 {
        engine.fail_next("find_folder", ShellQueryError::transport("connection reset"));
    }
    let p = pipeline(engine);
    p.submit("run1", "SELECT 1 AS One", None).await;

    p.drain().await;

    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    assert_eq!(execute.state, JobState::Failed);
    assert_eq!(execute.attempts_made, 3);
    assert_eq!(p.engine.count("find_folder"), 3);
    assert_eq!(
        p.runs.get_run("run1").await.unwrap().unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn test_redelivered_execute_never_dispatches_twice() {
    let engine = MockEngineClient::new();
    engine.set_default_task_status(TaskStatus::new(AsyncStatus::Processing));
    let p = pipeline(engine);
    p.submit("run1", "SELECT 1 AS One", None).await;

    p.worker.run_next_job().await.unwrap();
    let execute = p.queue.get(&execute_job_id("run1")).await.unwrap().unwrap();
    let run = p.runs.get_run("run1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Running);

    let outcome = p.processor.process(&execute.job, JobContext::new(0, 3)).await;
    assert_eq!(
        outcome,
        Outcome::Completed(JobResult::PollEnqueued {
            run_id: "run1".to_string(),
            task_id: run.task_id.clone().unwrap(),
            query_definition_id: run.query_definition_id.clone().unwrap(),
        })
    );
    assert_eq!(p.engine.count("perform_query_definition"), 1);
    assert_eq!(p.engine.count("create_query_definition"), 1);

    assert!(p.runs.mark_ready("run1").await.unwrap());
    let outcome = p.processor.process(&execute.job, JobContext::new(1, 3)).await;
    assert_eq!(
        outcome,
        Outcome::Completed(JobResult::Ready {
            run_id: "run1".to_string()
        })
    );
    assert_eq!(p.engine.count("perform_query_definition"), 1);
}

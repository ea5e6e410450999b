//! The full pipeline over the SQLite state database.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use shell_query::app::{App, Submission};
use shell_query::config::Config;
use shell_query::crypto::AesGcmCipher;
use shell_query::engine::{AsyncStatus, MockEngineClient, TaskStatus};
use shell_query::jobs::{execute_job_id, poll_job_id, JobQueue, JobState};
use shell_query::persistence::StateDb;
use shell_query::run::{RunStatus, RunStore};
use shell_query::status::StatusKind;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use super::common::{polling_config, worker_config};

fn config(key: &str) -> Config {
    let mut config = Config::default();
    config.crypto.key = Some(key.to_string());
    config.polling = polling_config();
    config.worker = worker_config();
    config
}

fn submission(sql: &str) -> Submission {
    Submission {
        tenant_id: "tenant".to_string(),
        user_id: "user".to_string(),
        mid: "100".to_string(),
        sql: sql.to_string(),
        ..Submission::default()
    }
}

/// Runs the worker until nothing is due, then once more after any poll delay.
async fn drain(app: &App, engine: &Arc<MockEngineClient>) {
    for _ in 0..20 {
        app.run_worker(engine.clone(), true, CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let pending = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE state IN ('waiting', 'delayed', 'active')",
        )
        .fetch_one(app.db().pool())
        .await
        .unwrap();
        if pending == 0 {
            return;
        }
    }
    panic!("jobs did not drain");
}

#[tokio::test]
async fn test_run_reaches_ready_through_state_db() {
    let dir = tempdir().unwrap();
    let key = AesGcmCipher::generate_key();
    let db = StateDb::open(&dir.path().join("state.db")).await.unwrap();
    let app = App::with_db(config(&key), db).unwrap();

    let engine = Arc::new(MockEngineClient::new());
    engine.push_task_status(TaskStatus::new(AsyncStatus::Processing));
    let run_id = app.submit(submission("SELECT 1 AS One")).await.unwrap();

    drain(&app, &engine).await;

    let report = app.report(&run_id, true).await.unwrap();
    assert_eq!(report.run.status, RunStatus::Ready);
    assert!(report.run.task_id.is_some());
    assert_eq!(
        report.latest_event.map(|e| e.status),
        Some(StatusKind::Ready)
    );
    let statuses: Vec<_> = report.events.iter().map(|e| e.status).collect();
    assert_eq!(statuses.first(), Some(&StatusKind::Queued));
    assert_eq!(statuses.last(), Some(&StatusKind::Ready));

    let poll = app.db().get(&poll_job_id(&run_id)).await.unwrap().unwrap();
    assert_eq!(poll.state, JobState::Completed);

    // The stored execute payload no longer carries the SQL.
    let (payload,): (String,) = sqlx::query_as("SELECT payload FROM jobs WHERE id = ?")
        .bind(execute_job_id(&run_id))
        .fetch_one(app.db().pool())
        .await
        .unwrap();
    assert!(!payload.contains("sqlText"), "{payload}");
    app.close().await;
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let key = AesGcmCipher::generate_key();

    let run_id = {
        let app = App::with_db(config(&key), StateDb::open(&path).await.unwrap()).unwrap();
        let run_id = app.submit(submission("SELECT 1 AS One")).await.unwrap();
        app.close().await;
        run_id
    };

    let db = StateDb::open(&path).await.unwrap();
    let run = db.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Queued);
    let claimed = db.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, execute_job_id(&run_id));
    db.close().await;
}

#[tokio::test]
async fn test_cancel_through_state_db() {
    let dir = tempdir().unwrap();
    let key = AesGcmCipher::generate_key();
    let db = StateDb::open(&dir.path().join("state.db")).await.unwrap();
    let mut config = config(&key);
    // Keep the first poll out of the worker's reach until after the cancel.
    config.polling.backoff_base_ms = 200;
    config.polling.backoff_cap_ms = 200;
    let app = App::with_db(config, db).unwrap();

    let engine = Arc::new(MockEngineClient::new());
    engine.set_default_task_status(TaskStatus::new(AsyncStatus::Processing));
    let run_id = app.submit(submission("SELECT 1 AS One")).await.unwrap();

    app.run_worker(engine.clone(), true, CancellationToken::new())
        .await
        .unwrap();
    assert!(app.cancel(&run_id).await.unwrap());
    drain(&app, &engine).await;

    let report = app.report(&run_id, false).await.unwrap();
    assert_eq!(report.run.status, RunStatus::Canceled);
    assert_eq!(
        report.latest_event.map(|e| e.status),
        Some(StatusKind::Canceled)
    );
    assert_eq!(engine.count("delete_query_definition"), 1);
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_job() {
    let dir = tempdir().unwrap();
    let key = AesGcmCipher::generate_key();
    let db = StateDb::open(&dir.path().join("state.db")).await.unwrap();
    let app = Arc::new(App::with_db(config(&key), db).unwrap());
    for _ in 0..10 {
        app.submit(submission("SELECT 1 AS One")).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = app.db().claim_next().await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }
    let mut all: Vec<String> = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort();
    let before = all.len();
    all.dedup();
    assert_eq!(before, 10);
    assert_eq!(all.len(), 10);
}

//! shell-query: runs ad-hoc SQL against a remote marketing-data engine.
//!
//! A submitted run is carried by two durable jobs. The execute job validates
//! the SQL, expands `SELECT *`, infers or checks the destination schema and
//! dispatches the query. The poll job follows the dispatched task until it
//! completes, fails, times out or is canceled, publishing encrypted status
//! events along the way.

pub mod app;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod memory;
pub mod metadata;
pub mod persistence;
pub mod processor;
pub mod run;
pub mod sql;
pub mod status;
pub mod strategy;
pub mod validator;
pub mod worker;

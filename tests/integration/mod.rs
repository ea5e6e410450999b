//! Integration tests for shell-query.

pub mod common;
pub mod persistence_test;
pub mod pipeline_test;
pub mod sql_test;
pub mod target_test;

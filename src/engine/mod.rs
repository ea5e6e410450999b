//! Remote engine client abstraction.
//!
//! The remote engine runs queries asynchronously: a query definition bound to
//! a destination is created, performed (yielding a task id), and then polled.
//! The [`EngineClient`] trait covers every call the pipeline makes so that the
//! HTTP gateway client and the in-memory mock are interchangeable.

mod http;
mod mock;

pub use http::{HttpEngineClient, HttpEngineConfig};
pub use mock::{EngineCall, MockEngineClient};

use crate::error::Result;
use crate::metadata::FieldDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The tenant account a call acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineContext {
    pub tenant_id: String,
    pub user_id: String,
    /// Business unit identifier.
    pub mid: String,
    /// Enterprise identifier, when the business unit belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<String>,
}

/// Result of a pre-flight query validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// A folder (container) for generated artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: i64,
    pub name: String,
}

/// An existing destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub customer_key: String,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

/// Request to create a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDestination {
    pub name: String,
    pub customer_key: String,
    pub folder_id: i64,
    pub fields: Vec<FieldDefinition>,
    /// Days until the engine deletes the destination on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

/// How a query writes into its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateType {
    #[default]
    Overwrite,
    Append,
}

/// Request to create a query definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewQueryDefinition {
    pub name: String,
    pub customer_key: String,
    pub folder_id: i64,
    pub sql: String,
    pub target_key: String,
    pub target_name: String,
    #[serde(default)]
    pub update_type: UpdateType,
}

/// A created query definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    pub id: String,
    pub customer_key: String,
}

/// Status reported for an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AsyncStatus {
    Queued,
    Processing,
    Complete,
    Error,
    FatalError,
    /// Any status the pipeline does not act on; treated as still pending.
    Other(String),
}

impl AsyncStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "Queued",
            Self::Processing => "Processing",
            Self::Complete => "Complete",
            Self::Error => "Error",
            Self::FatalError => "FatalError",
            Self::Other(s) => s,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error | Self::FatalError)
    }
}

impl From<String> for AsyncStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Queued" => Self::Queued,
            "Processing" => Self::Processing,
            "Complete" => Self::Complete,
            "Error" => Self::Error,
            "FatalError" => Self::FatalError,
            _ => Self::Other(s),
        }
    }
}

impl From<AsyncStatus> for String {
    fn from(status: AsyncStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for AsyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Async status of a performed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub status: AsyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskStatus {
    pub fn new(status: AsyncStatus) -> Self {
        Self {
            status,
            error_message: None,
        }
    }
}

/// One page of a destination's rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rowset {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub page_size: u32,
}

/// Calls the pipeline makes against the remote engine.
///
/// Lookups return `Ok(None)` when the object does not exist; errors are
/// reserved for failed calls.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Validates `sql` without running it.
    async fn validate_query(&self, ctx: &EngineContext, sql: &str) -> Result<ValidationResult>;

    /// Finds a folder by name.
    async fn find_folder(&self, ctx: &EngineContext, name: &str) -> Result<Option<Folder>>;

    async fn create_folder(&self, ctx: &EngineContext, name: &str) -> Result<Folder>;

    /// Retrieves a destination and its fields by customer key.
    async fn get_destination(
        &self,
        ctx: &EngineContext,
        customer_key: &str,
    ) -> Result<Option<Destination>>;

    /// Retrieves the fields of a destination by name.
    async fn get_destination_fields(
        &self,
        ctx: &EngineContext,
        name: &str,
    ) -> Result<Option<Vec<FieldDefinition>>>;

    async fn create_destination(
        &self,
        ctx: &EngineContext,
        destination: &NewDestination,
    ) -> Result<Destination>;

    async fn delete_destination(&self, ctx: &EngineContext, customer_key: &str) -> Result<()>;

    /// Finds a query definition by customer key.
    async fn find_query_definition(
        &self,
        ctx: &EngineContext,
        customer_key: &str,
    ) -> Result<Option<QueryDefinition>>;

    async fn create_query_definition(
        &self,
        ctx: &EngineContext,
        definition: &NewQueryDefinition,
    ) -> Result<QueryDefinition>;

    async fn delete_query_definition(&self, ctx: &EngineContext, id: &str) -> Result<()>;

    /// Starts a query definition, returning the task id.
    async fn perform_query_definition(&self, ctx: &EngineContext, id: &str) -> Result<String>;

    async fn get_task_status(&self, ctx: &EngineContext, task_id: &str) -> Result<TaskStatus>;

    /// Asks whether the task is still executing.
    async fn is_running(&self, ctx: &EngineContext, task_id: &str) -> Result<bool>;

    /// Reads one page of a destination's rows (pages start at 1).
    async fn get_rowset(
        &self,
        ctx: &EngineContext,
        destination_key: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Rowset>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_status_round_trips_unknown_values() {
        let status: AsyncStatus = serde_json::from_str("\"Scheduled\"").unwrap();
        assert_eq!(status, AsyncStatus::Other("Scheduled".to_string()));
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"Scheduled\"");
    }

    #[test]
    fn test_async_status_errors() {
        assert!(AsyncStatus::Error.is_error());
        assert!(AsyncStatus::FatalError.is_error());
        assert!(!AsyncStatus::Complete.is_error());
    }

    #[test]
    fn test_task_status_deserializes_camel_case() {
        let status: TaskStatus =
            serde_json::from_str(r#"{"status":"Error","errorMessage":"Invalid column"}"#).unwrap();
        assert_eq!(status.status, AsyncStatus::Error);
        assert_eq!(status.error_message.as_deref(), Some("Invalid column"));
    }
}

//! In-memory remote engine for testing and local runs.
//!
//! Records every call and answers from scripted queues, falling back to a
//! happy path: queries validate, tasks complete, destinations have rows.

use super::{
    AsyncStatus, Destination, EngineClient, EngineContext, Folder, NewDestination,
    NewQueryDefinition, QueryDefinition, Rowset, TaskStatus, ValidationResult,
};
use crate::error::{Result, ShellQueryError};
use crate::metadata::FieldDefinition;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// A call made against the mock engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    ValidateQuery { sql: String },
    FindFolder { name: String },
    CreateFolder { name: String },
    GetDestination { customer_key: String },
    GetDestinationFields { name: String },
    CreateDestination { customer_key: String, fields: Vec<FieldDefinition> },
    DeleteDestination { customer_key: String },
    FindQueryDefinition { customer_key: String },
    CreateQueryDefinition { customer_key: String, sql: String, target_key: String },
    DeleteQueryDefinition { id: String },
    PerformQueryDefinition { id: String },
    GetTaskStatus { task_id: String },
    IsRunning { task_id: String },
    GetRowset { destination_key: String, page: u32, page_size: u32 },
}

impl EngineCall {
    /// Operation name, as used by [`MockEngineClient::fail_next`].
    pub fn op(&self) -> &'static str {
        match self {
            Self::ValidateQuery { .. } => "validate_query",
            Self::FindFolder { .. } => "find_folder",
            Self::CreateFolder { .. } => "create_folder",
            Self::GetDestination { .. } => "get_destination",
            Self::GetDestinationFields { .. } => "get_destination_fields",
            Self::CreateDestination { .. } => "create_destination",
            Self::DeleteDestination { .. } => "delete_destination",
            Self::FindQueryDefinition { .. } => "find_query_definition",
            Self::CreateQueryDefinition { .. } => "create_query_definition",
            Self::DeleteQueryDefinition { .. } => "delete_query_definition",
            Self::PerformQueryDefinition { .. } => "perform_query_definition",
            Self::GetTaskStatus { .. } => "get_task_status",
            Self::IsRunning { .. } => "is_running",
            Self::GetRowset { .. } => "get_rowset",
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<EngineCall>,
    failures: HashMap<&'static str, VecDeque<ShellQueryError>>,
    validations: VecDeque<ValidationResult>,
    folders: Vec<Folder>,
    destinations: Vec<Destination>,
    query_definitions: Vec<QueryDefinition>,
    task_statuses: VecDeque<TaskStatus>,
    default_task_status: Option<TaskStatus>,
    running: VecDeque<bool>,
    rowset_ready: VecDeque<bool>,
    next_id: u64,
}

/// Scriptable in-memory [`EngineClient`].
#[derive(Default)]
pub struct MockEngineClient {
    state: Mutex<MockState>,
}

impl MockEngineClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded calls.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an existing destination.
    pub fn with_destination(self, destination: Destination) -> Self {
        self.state().destinations.push(destination);
        self
    }

    /// Adds an existing folder.
    pub fn with_folder(self, folder: Folder) -> Self {
        self.state().folders.push(folder);
        self
    }

    /// Queues the answer to the next validation call.
    pub fn push_validation(&self, result: ValidationResult) {
        self.state().validations.push_back(result);
    }

    /// Queues the answer to the next async-status call.
    pub fn push_task_status(&self, status: TaskStatus) {
        self.state().task_statuses.push_back(status);
    }

    /// Status returned once the queued statuses run out (default: Complete).
    pub fn set_default_task_status(&self, status: TaskStatus) {
        self.state().default_task_status = Some(status);
    }

    /// Queues the answer to the next isRunning call (default: false).
    pub fn push_is_running(&self, running: bool) {
        self.state().running.push_back(running);
    }

    /// Queues whether the next rowset read finds rows (default: true).
    pub fn push_rowset_ready(&self, ready: bool) {
        self.state().rowset_ready.push_back(ready);
    }

    /// Makes the next call of operation `op` fail with `error`.
    pub fn fail_next(&self, op: &'static str, error: ShellQueryError) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    /// Number of calls made to operation `op`.
    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op() == op).count()
    }

    /// Customer keys of destinations currently present.
    pub fn destination_keys(&self) -> Vec<String> {
        self.state()
            .destinations
            .iter()
            .map(|d| d.customer_key.clone())
            .collect()
    }

    /// Records a call and returns the scripted failure for it, if any.
    fn record(&self, call: EngineCall) -> Result<MutexGuard<'_, MockState>> {
        let mut state = self.state();
        let op = call.op();
        state.calls.push(call);
        if let Some(error) = state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(state)
    }
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

#[async_trait]
impl EngineClient for MockEngineClient {
    async fn validate_query(&self, _ctx: &EngineContext, sql: &str) -> Result<ValidationResult> {
        let mut state = self.record(EngineCall::ValidateQuery {
            sql: sql.to_string(),
        })?;
        Ok(state
            .validations
            .pop_front()
            .unwrap_or_else(ValidationResult::valid))
    }

    async fn find_folder(&self, _ctx: &EngineContext, name: &str) -> Result<Option<Folder>> {
        let state = self.record(EngineCall::FindFolder {
            name: name.to_string(),
        })?;
        Ok(state.folders.iter().find(|f| f.name == name).cloned())
    }

    async fn create_folder(&self, _ctx: &EngineContext, name: &str) -> Result<Folder> {
        let mut state = self.record(EngineCall::CreateFolder {
            name: name.to_string(),
        })?;
        state.next_id += 1;
        let folder = Folder {
            id: 1000 + state.next_id as i64,
            name: name.to_string(),
        };
        state.folders.push(folder.clone());
        Ok(folder)
    }

    async fn get_destination(
        &self,
        _ctx: &EngineContext,
        customer_key: &str,
    ) -> Result<Option<Destination>> {
        let state = self.record(EngineCall::GetDestination {
            customer_key: customer_key.to_string(),
        })?;
        Ok(state
            .destinations
            .iter()
            .find(|d| d.customer_key.eq_ignore_ascii_case(customer_key))
            .cloned())
    }

    async fn get_destination_fields(
        &self,
        _ctx: &EngineContext,
        name: &str,
    ) -> Result<Option<Vec<FieldDefinition>>> {
        let state = self.record(EngineCall::GetDestinationFields {
            name: name.to_string(),
        })?;
        Ok(state
            .destinations
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .map(|d| d.fields.clone()))
    }

    async fn create_destination(
        &self,
        _ctx: &EngineContext,
        destination: &NewDestination,
    ) -> Result<Destination> {
        let mut state = self.record(EngineCall::CreateDestination {
            customer_key: destination.customer_key.clone(),
            fields: destination.fields.clone(),
        })?;
        if state
            .destinations
            .iter()
            .any(|d| d.customer_key.eq_ignore_ascii_case(&destination.customer_key))
        {
            return Err(ShellQueryError::upstream(
                Some(409),
                format!("Destination '{}' already exists", destination.customer_key),
            ));
        }
        let created = Destination {
            customer_key: destination.customer_key.clone(),
            name: destination.name.clone(),
            fields: destination.fields.clone(),
        };
        state.destinations.push(created.clone());
        Ok(created)
    }

    async fn delete_destination(&self, _ctx: &EngineContext, customer_key: &str) -> Result<()> {
        let mut state = self.record(EngineCall::DeleteDestination {
            customer_key: customer_key.to_string(),
        })?;
        state
            .destinations
            .retain(|d| !d.customer_key.eq_ignore_ascii_case(customer_key));
        Ok(())
    }

    async fn find_query_definition(
        &self,
        _ctx: &EngineContext,
        customer_key: &str,
    ) -> Result<Option<QueryDefinition>> {
        let state = self.record(EngineCall::FindQueryDefinition {
            customer_key: customer_key.to_string(),
        })?;
        Ok(state
            .query_definitions
            .iter()
            .find(|q| q.customer_key == customer_key)
            .cloned())
    }

    async fn create_query_definition(
        &self,
        _ctx: &EngineContext,
        definition: &NewQueryDefinition,
    ) -> Result<QueryDefinition> {
        let mut state = self.record(EngineCall::CreateQueryDefinition {
            customer_key: definition.customer_key.clone(),
            sql: definition.sql.clone(),
            target_key: definition.target_key.clone(),
        })?;
        if state
            .query_definitions
            .iter()
            .any(|q| q.customer_key == definition.customer_key)
        {
            return Err(ShellQueryError::upstream(
                Some(409),
                format!("Query definition '{}' already exists", definition.customer_key),
            ));
        }
        let created = QueryDefinition {
            id: state.next_id("qd"),
            customer_key: definition.customer_key.clone(),
        };
        state.query_definitions.push(created.clone());
        Ok(created)
    }

    async fn delete_query_definition(&self, _ctx: &EngineContext, id: &str) -> Result<()> {
        let mut state = self.record(EngineCall::DeleteQueryDefinition { id: id.to_string() })?;
        state.query_definitions.retain(|q| q.id != id);
        Ok(())
    }

    async fn perform_query_definition(&self, _ctx: &EngineContext, id: &str) -> Result<String> {
        let mut state = self.record(EngineCall::PerformQueryDefinition { id: id.to_string() })?;
        if !state.query_definitions.iter().any(|q| q.id == id) {
            return Err(ShellQueryError::upstream(
                Some(404),
                format!("Query definition '{id}' does not exist"),
            ));
        }
        Ok(state.next_id("task"))
    }

    async fn get_task_status(&self, _ctx: &EngineContext, task_id: &str) -> Result<TaskStatus> {
        let mut state = self.record(EngineCall::GetTaskStatus {
            task_id: task_id.to_string(),
        })?;
        let fallback = state
            .default_task_status
            .clone()
            .unwrap_or_else(|| TaskStatus::new(AsyncStatus::Complete));
        Ok(state.task_statuses.pop_front().unwrap_or(fallback))
    }

    async fn is_running(&self, _ctx: &EngineContext, task_id: &str) -> Result<bool> {
        let mut state = self.record(EngineCall::IsRunning {
            task_id: task_id.to_string(),
        })?;
        Ok(state.running.pop_front().unwrap_or(false))
    }

    async fn get_rowset(
        &self,
        _ctx: &EngineContext,
        destination_key: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Rowset> {
        let mut state = self.record(EngineCall::GetRowset {
            destination_key: destination_key.to_string(),
            page,
            page_size,
        })?;
        let ready = state.rowset_ready.pop_front().unwrap_or(true);
        let items = if ready {
            vec![serde_json::json!({ "keys": {}, "values": {} })]
        } else {
            Vec::new()
        };
        Ok(Rowset {
            count: items.len() as u64,
            items,
            page,
            page_size,
        })
    }
}

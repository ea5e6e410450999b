//! HTTP client for the remote engine gateway.
//!
//! The gateway owns the engine's SOAP marshaling and exposes JSON endpoints.
//! Tenant context travels in headers; transient failures (429, 5xx, timeouts,
//! connection errors) are retried with exponential backoff.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{
    Destination, EngineClient, EngineContext, Folder, NewDestination, NewQueryDefinition,
    QueryDefinition, Rowset, TaskStatus, ValidationResult,
};
use crate::config::EngineConfig;
use crate::error::{Result, ShellQueryError};
use crate::metadata::FieldDefinition;

/// Base delay for exponential backoff (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    pub base_url: Url,
    pub token: Option<String>,
    pub timeout: Duration,
    pub retry_attempts: u32,
}

impl HttpEngineConfig {
    /// Builds the client configuration from the `[engine]` section.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.url()?,
            token: config.token.clone(),
            timeout: config.timeout(),
            retry_attempts: config.retry_attempts.max(1),
        })
    }
}

/// Remote engine client speaking to the JSON gateway.
#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    config: HttpEngineConfig,
    client: Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest<'a> {
    sql: &'a str,
}

#[derive(Serialize)]
struct FolderRequest<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerformResponse {
    task_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsRunningResponse {
    is_running: bool,
}

#[derive(Deserialize)]
struct FieldsResponse {
    fields: Vec<FieldDefinition>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    message: String,
}

impl HttpEngineClient {
    pub fn new(config: HttpEngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ShellQueryError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Builds an endpoint URL from path segments, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ShellQueryError::config("Engine URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Maps an error response to an upstream error.
    fn parse_error(status: StatusCode, body: &str) -> ShellQueryError {
        let message = serde_json::from_str::<ErrorResponse>(body)
            .map(|e| e.message)
            .unwrap_or_else(|_| format!("Engine gateway error ({status}): {body}"));
        ShellQueryError::upstream(Some(status.as_u16()), message)
    }

    /// Sends a request, retrying transient failures. Returns `None` on 404.
    async fn send<B: Serialize + Sync + ?Sized>(
        &self,
        ctx: &EngineContext,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<Option<String>> {
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let attempts = self.config.retry_attempts;
        let mut attempt = 1;

        loop {
            debug!(%method, %url, attempt, "Engine request");
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header("X-Tenant-Id", &ctx.tenant_id)
                .header("X-User-Id", &ctx.user_id)
                .header("X-Mid", &ctx.mid);
            if let Some(eid) = &ctx.eid {
                request = request.header("X-Eid", eid);
            }
            if let Some(token) = &self.config.token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let error = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    let text = response.text().await.map_err(|e| {
                        ShellQueryError::transport(format!("Failed to read engine response: {e}"))
                    })?;
                    if status.is_success() {
                        return Ok(Some(text));
                    }
                    Self::parse_error(status, &text)
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    ShellQueryError::transport(format!("Engine request failed: {e}"))
                }
                Err(e) => {
                    return Err(ShellQueryError::upstream(
                        None,
                        format!("Engine request failed: {e}"),
                    ))
                }
            };

            if !error.is_transient_upstream() || attempt >= attempts {
                return Err(error);
            }

            warn!(
                "Engine request failed (attempt {}), retrying in {:?}: {}",
                attempt, delay, error
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }

    async fn get_optional<T: DeserializeOwned>(
        &self,
        ctx: &EngineContext,
        url: Url,
    ) -> Result<Option<T>> {
        match self.send::<()>(ctx, Method::GET, url, None).await? {
            Some(body) => parse_body(&body).map(Some),
            None => Ok(None),
        }
    }

    async fn request_json<T: DeserializeOwned, B: Serialize + Sync + ?Sized>(
        &self,
        ctx: &EngineContext,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<T> {
        let path = url.path().to_string();
        match self.send(ctx, method, url, body).await? {
            Some(text) => parse_body(&text),
            None => Err(ShellQueryError::upstream(
                Some(404),
                format!("Engine endpoint not found: {path}"),
            )),
        }
    }

    async fn delete(&self, ctx: &EngineContext, url: Url) -> Result<()> {
        // Already gone is as good as deleted.
        self.send::<()>(ctx, Method::DELETE, url, None).await?;
        Ok(())
    }
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| ShellQueryError::upstream(None, format!("Invalid engine response: {e}")))
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn validate_query(&self, ctx: &EngineContext, sql: &str) -> Result<ValidationResult> {
        let url = self.endpoint(&["v1", "queries", "validate"])?;
        self.request_json(ctx, Method::POST, url, Some(&ValidateRequest { sql }))
            .await
    }

    async fn find_folder(&self, ctx: &EngineContext, name: &str) -> Result<Option<Folder>> {
        let mut url = self.endpoint(&["v1", "folders"])?;
        url.query_pairs_mut().append_pair("name", name);
        let folders: Option<Vec<Folder>> = self.get_optional(ctx, url).await?;
        Ok(folders.and_then(|f| f.into_iter().find(|folder| folder.name == name)))
    }

    async fn create_folder(&self, ctx: &EngineContext, name: &str) -> Result<Folder> {
        let url = self.endpoint(&["v1", "folders"])?;
        self.request_json(ctx, Method::POST, url, Some(&FolderRequest { name }))
            .await
    }

    async fn get_destination(
        &self,
        ctx: &EngineContext,
        customer_key: &str,
    ) -> Result<Option<Destination>> {
        let url = self.endpoint(&["v1", "destinations", customer_key])?;
        self.get_optional(ctx, url).await
    }

    async fn get_destination_fields(
        &self,
        ctx: &EngineContext,
        name: &str,
    ) -> Result<Option<Vec<FieldDefinition>>> {
        let url = self.endpoint(&["v1", "destinations", "by-name", name, "fields"])?;
        let response: Option<FieldsResponse> = self.get_optional(ctx, url).await?;
        Ok(response.map(|r| r.fields))
    }

    async fn create_destination(
        &self,
        ctx: &EngineContext,
        destination: &NewDestination,
    ) -> Result<Destination> {
        let url = self.endpoint(&["v1", "destinations"])?;
        self.request_json(ctx, Method::POST, url, Some(destination))
            .await
    }

    async fn delete_destination(&self, ctx: &EngineContext, customer_key: &str) -> Result<()> {
        let url = self.endpoint(&["v1", "destinations", customer_key])?;
        self.delete(ctx, url).await
    }

    async fn find_query_definition(
        &self,
        ctx: &EngineContext,
        customer_key: &str,
    ) -> Result<Option<QueryDefinition>> {
        let url = self.endpoint(&["v1", "query-definitions", "by-key", customer_key])?;
        self.get_optional(ctx, url).await
    }

    async fn create_query_definition(
        &self,
        ctx: &EngineContext,
        definition: &NewQueryDefinition,
    ) -> Result<QueryDefinition> {
        let url = self.endpoint(&["v1", "query-definitions"])?;
        self.request_json(ctx, Method::POST, url, Some(definition))
            .await
    }

    async fn delete_query_definition(&self, ctx: &EngineContext, id: &str) -> Result<()> {
        let url = self.endpoint(&["v1", "query-definitions", id])?;
        self.delete(ctx, url).await
    }

    async fn perform_query_definition(&self, ctx: &EngineContext, id: &str) -> Result<String> {
        let url = self.endpoint(&["v1", "query-definitions", id, "perform"])?;
        let response: PerformResponse = self
            .request_json::<_, ()>(ctx, Method::POST, url, None)
            .await?;
        Ok(response.task_id)
    }

    async fn get_task_status(&self, ctx: &EngineContext, task_id: &str) -> Result<TaskStatus> {
        let url = self.endpoint(&["v1", "tasks", task_id, "status"])?;
        self.request_json::<_, ()>(ctx, Method::GET, url, None)
            .await
    }

    async fn is_running(&self, ctx: &EngineContext, task_id: &str) -> Result<bool> {
        let url = self.endpoint(&["v1", "tasks", task_id, "is-running"])?;
        let response: IsRunningResponse = self
            .request_json::<_, ()>(ctx, Method::GET, url, None)
            .await?;
        Ok(response.is_running)
    }

    async fn get_rowset(
        &self,
        ctx: &EngineContext,
        destination_key: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Rowset> {
        let mut url = self.endpoint(&["v1", "destinations", destination_key, "rowset"])?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("pageSize", &page_size.to_string());
        self.request_json::<_, ()>(ctx, Method::GET, url, None)
            .await
    }
}

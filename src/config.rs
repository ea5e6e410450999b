//! Configuration management for shell-query.
//!
//! Handles loading configuration from TOML files and environment variables.
//! Every section has defaults, so a missing file yields a usable configuration
//! for the mock engine.

use crate::error::{Result, ShellQueryError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const ENV_ENGINE_URL: &str = "SHELL_QUERY_ENGINE_URL";
pub const ENV_ENGINE_TOKEN: &str = "SHELL_QUERY_ENGINE_TOKEN";
pub const ENV_ENCRYPTION_KEY: &str = "SHELL_QUERY_ENCRYPTION_KEY";
pub const ENV_STATE_DB: &str = "SHELL_QUERY_STATE_DB";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Remote engine gateway.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Poll job limits, backoff and liveness detection.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Queue worker settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Generated artifact settings.
    #[serde(default)]
    pub results: ResultsConfig,

    /// Status event settings.
    #[serde(default)]
    pub status: StatusConfig,

    /// Payload encryption.
    #[serde(default)]
    pub crypto: CryptoConfig,
}

/// Remote engine gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Gateway base URL, e.g. `https://engine-gateway.internal/`.
    pub base_url: Option<String>,

    /// Bearer token (prefer the environment variable over the file).
    pub token: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per request for transient failures.
    #[serde(default = "default_engine_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_engine_timeout_secs() -> u64 {
    30
}

fn default_engine_retry_attempts() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            timeout_secs: default_engine_timeout_secs(),
            retry_attempts: default_engine_retry_attempts(),
        }
    }
}

impl EngineConfig {
    /// Parses and checks the configured base URL.
    pub fn url(&self) -> Result<Url> {
        let raw = self
            .base_url
            .as_deref()
            .ok_or_else(|| ShellQueryError::config("engine.base_url is not set"))?;
        let url = Url::parse(raw)
            .map_err(|e| ShellQueryError::config(format!("Invalid engine URL: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ShellQueryError::config(format!(
                "Invalid scheme '{}'. Expected 'http' or 'https'",
                url.scheme()
            )));
        }
        Ok(url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Poll job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Wall-clock limit measured from the first poll.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Maximum number of status checks.
    #[serde(default = "default_max_poll_count")]
    pub max_poll_count: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Jitter band as a fraction of the delay (0.2 = ±20%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Runtime after which a pending task may be probed for rows.
    #[serde(default = "default_fast_path_min_runtime_secs")]
    pub fast_path_min_runtime_secs: u64,

    /// Runtime after which a pending task is checked with isRunning.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,

    /// Minimum gap between two "not running" observations.
    #[serde(default = "default_not_running_gap_secs")]
    pub not_running_confirmation_gap_secs: u64,

    #[serde(default = "default_rowset_ready_attempts")]
    pub rowset_ready_attempts: u32,

    #[serde(default = "default_rowset_ready_base_delay_ms")]
    pub rowset_ready_base_delay_ms: u64,

    /// Return bookkeeping instead of rescheduling (deterministic tests).
    #[serde(default)]
    pub test_mode: bool,
}

fn default_max_duration_secs() -> u64 {
    30 * 60
}

fn default_max_poll_count() -> u32 {
    120
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_fast_path_min_runtime_secs() -> u64 {
    30
}

fn default_stuck_threshold_secs() -> u64 {
    3 * 60
}

fn default_not_running_gap_secs() -> u64 {
    15
}

fn default_rowset_ready_attempts() -> u32 {
    3
}

fn default_rowset_ready_base_delay_ms() -> u64 {
    1_000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            max_poll_count: default_max_poll_count(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter: default_jitter(),
            fast_path_min_runtime_secs: default_fast_path_min_runtime_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            not_running_confirmation_gap_secs: default_not_running_gap_secs(),
            rowset_ready_attempts: default_rowset_ready_attempts(),
            rowset_ready_base_delay_ms: default_rowset_ready_base_delay_ms(),
            test_mode: false,
        }
    }
}

impl PollingConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn fast_path_min_runtime(&self) -> Duration {
        Duration::from_secs(self.fast_path_min_runtime_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn not_running_confirmation_gap(&self) -> Duration {
        Duration::from_secs(self.not_running_confirmation_gap_secs)
    }

    pub fn rowset_ready_base_delay(&self) -> Duration {
        Duration::from_millis(self.rowset_ready_base_delay_ms)
    }

    /// Checks the relationships between settings.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ShellQueryError::config(format!(
                "polling.jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ShellQueryError::config(
                "polling.backoff_cap_ms must not be lower than polling.backoff_base_ms",
            ));
        }
        if self.stuck_threshold_secs < self.fast_path_min_runtime_secs {
            return Err(ShellQueryError::config(
                "polling.stuck_threshold_secs must not be lower than polling.fast_path_min_runtime_secs",
            ));
        }
        Ok(())
    }
}

/// Queue worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deliveries per job before a retryable error becomes permanent.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Sleep between empty queue checks.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Random extra sleep added to each idle wait.
    #[serde(default = "default_idle_jitter_ms")]
    pub idle_jitter_ms: u64,

    /// Base delay before a retried job is delivered again.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// State database path; the platform default is used when unset.
    pub state_db: Option<PathBuf>,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_idle_poll_ms() -> u64 {
    500
}

fn default_idle_jitter_ms() -> u64 {
    250
}

fn default_retry_backoff_ms() -> u64 {
    5_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            idle_poll_ms: default_idle_poll_ms(),
            idle_jitter_ms: default_idle_jitter_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            state_db: None,
        }
    }
}

/// Generated artifact configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// Name of the tenant folder holding generated artifacts.
    #[serde(default = "default_folder_name")]
    pub folder_name: String,

    /// Days before a temporary destination is expired by the engine.
    #[serde(default = "default_retention_days")]
    pub temp_retention_days: u32,
}

fn default_folder_name() -> String {
    "Shell Query Results".to_string()
}

fn default_retention_days() -> u32 {
    1
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            folder_name: default_folder_name(),
            temp_retention_days: default_retention_days(),
        }
    }
}

/// Status event configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// How long the latest event per run stays readable.
    #[serde(default = "default_latest_ttl_secs")]
    pub latest_event_ttl_secs: u64,
}

fn default_latest_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            latest_event_ttl_secs: default_latest_ttl_secs(),
        }
    }
}

impl StatusConfig {
    pub fn latest_event_ttl(&self) -> Duration {
        Duration::from_secs(self.latest_event_ttl_secs)
    }
}

/// Encryption configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CryptoConfig {
    /// Base64-encoded 32-byte AES key.
    pub key: Option<String>,
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shell-query")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file, then applies environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.polling.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ShellQueryError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ShellQueryError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies `SHELL_QUERY_*` environment variables over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(ENV_ENGINE_URL) {
            self.engine.base_url = Some(url);
        }
        if let Ok(token) = std::env::var(ENV_ENGINE_TOKEN) {
            self.engine.token = Some(token);
        }
        if let Ok(key) = std::env::var(ENV_ENCRYPTION_KEY) {
            self.crypto.key = Some(key);
        }
        if let Ok(path) = std::env::var(ENV_STATE_DB) {
            self.worker.state_db = Some(PathBuf::from(path));
        }
    }
}

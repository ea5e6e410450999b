//! Error types for shell query execution.
//!
//! Defines the main error enum used throughout the crate. Variants follow the
//! execution pipeline's failure taxonomy so that the job processor can decide
//! between retrying, failing a run, or degrading gracefully.

use thiserror::Error;

/// Main error type for shell query operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShellQueryError {
    /// Undecryptable or malformed job payload. Never retried.
    #[error("Input error: {0}")]
    Input(String),

    /// Query or schema validation failed with one or more violations.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        violations: Vec<String>,
    },

    /// A referenced remote object (destination, folder) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is structurally valid but cannot be honored.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// `SELECT *` could not be expanded into an explicit column list.
    #[error("Select star expansion failed: {0}")]
    SelectStarExpansionFailed(String),

    /// The output schema of a query could not be inferred.
    #[error("Schema inference failed: {0}")]
    SchemaInferenceFailed(String),

    /// The remote engine returned an error or could not be reached.
    #[error("Upstream error: {message}")]
    Upstream {
        /// HTTP status, when the failure came from a response.
        status: Option<u16>,
        message: String,
        /// True for timeouts and connection failures.
        transport: bool,
    },

    /// Polling exceeded its maximum wall-clock duration.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Polling exceeded its maximum number of checks.
    #[error("Poll budget exceeded: {0}")]
    BudgetExceeded(String),

    /// State database errors.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Encryption or decryption failures outside of job input handling.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShellQueryError {
    /// Creates an input error with the given message.
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    /// Creates a validation error carrying the full list of violations.
    pub fn validation(msg: impl Into<String>, violations: Vec<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            violations,
        }
    }

    /// Creates a not-found error with the given message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a bad-request error with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Creates a select-star expansion error with the given message.
    pub fn expansion(msg: impl Into<String>) -> Self {
        Self::SelectStarExpansionFailed(msg.into())
    }

    /// Creates a schema inference error with the given message.
    pub fn inference(msg: impl Into<String>) -> Self {
        Self::SchemaInferenceFailed(msg.into())
    }

    /// Creates an upstream error from an HTTP response status.
    pub fn upstream(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: msg.into(),
            transport: false,
        }
    }

    /// Creates an upstream error for a timeout or network failure.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Upstream {
            status: None,
            message: msg.into(),
            transport: true,
        }
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates a crypto error with the given message.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Input(_) => "Input Error",
            Self::Validation { .. } => "Validation Error",
            Self::NotFound(_) => "Not Found",
            Self::BadRequest(_) => "Bad Request",
            Self::SelectStarExpansionFailed(_) => "Expansion Error",
            Self::SchemaInferenceFailed(_) => "Inference Error",
            Self::Upstream { .. } => "Upstream Error",
            Self::Timeout(_) => "Timeout",
            Self::BudgetExceeded(_) => "Budget Exceeded",
            Self::Persistence(_) => "Persistence Error",
            Self::Crypto(_) => "Crypto Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Returns true if another delivery of the same job could succeed.
    ///
    /// Input, validation, lookup and analysis failures are deterministic and
    /// fail the run on the first attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. } | Self::Persistence(_) | Self::Internal(_) | Self::Crypto(_)
        )
    }

    /// Returns true for upstream failures that indicate the engine is degraded
    /// rather than that the request was rejected: 5xx, 429, timeouts and
    /// connection errors.
    pub fn is_transient_upstream(&self) -> bool {
        match self {
            Self::Upstream {
                status, transport, ..
            } => *transport || matches!(status, Some(s) if *s >= 500 || *s == 429),
            _ => false,
        }
    }

    /// Violations attached to a validation error, empty for other kinds.
    pub fn violations(&self) -> &[String] {
        match self {
            Self::Validation { violations, .. } => violations,
            _ => &[],
        }
    }
}

/// Result type alias using ShellQueryError.
pub type Result<T> = std::result::Result<T, ShellQueryError>;

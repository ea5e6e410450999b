//! Pre-flight query validation against the remote engine.
//!
//! A degraded validator must not block execution: 5xx, 429, timeouts and
//! connection failures yield [`Validation::Unavailable`] and the caller
//! proceeds unvalidated. Any other failure propagates.

use crate::engine::{EngineClient, EngineContext};
use crate::error::{Result, ShellQueryError};
use tracing::{debug, warn};

/// Outcome of validating a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(Vec<String>),
    /// The validator could not be reached; the query was not checked.
    Unavailable(String),
}

impl Validation {
    /// Converts an explicit rejection into a validation error.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Invalid(errors) => {
                let message = if errors.is_empty() {
                    "Query validation failed".to_string()
                } else {
                    format!("Query validation failed: {}", errors.join("; "))
                };
                Err(ShellQueryError::validation(message, errors))
            }
            Self::Valid | Self::Unavailable(_) => Ok(()),
        }
    }
}

pub struct QueryValidator<'a> {
    engine: &'a dyn EngineClient,
}

impl<'a> QueryValidator<'a> {
    pub fn new(engine: &'a dyn EngineClient) -> Self {
        Self { engine }
    }

    pub async fn validate(&self, ctx: &EngineContext, sql: &str) -> Result<Validation> {
        match self.engine.validate_query(ctx, sql).await {
            Ok(result) if result.valid => Ok(Validation::Valid),
            Ok(result) => {
                debug!(errors = result.errors.len(), "Query rejected by validator");
                Ok(Validation::Invalid(result.errors))
            }
            Err(e) if e.is_transient_upstream() => {
                warn!("Query validator unavailable, proceeding unvalidated: {e}");
                Ok(Validation::Unavailable(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

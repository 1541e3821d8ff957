//! Crate-wide error taxonomy.
//!
//! Routine failures never cross the public boundary as panics; the
//! orchestrator converts them into structured artifact fields. The
//! variants map one-to-one onto the classes the pipeline distinguishes:
//!
//! - `Config` — fatal misconfiguration at startup (missing dataset,
//!   unparseable TTL corpus, bad TTL values).
//! - `DataNotAvailable` — the question cannot be grounded in the
//!   allow-listed tables.
//! - `Validation` — the warehouse dry-run rejected the SQL; eligible for
//!   LLM-assisted repair retries.
//! - `Execution` — the warehouse execute failed; not retried.
//! - `Transient` — LLM / embedding / vector-store / cache hiccup.

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Unified error type for the question-answering core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("data not available: {0}")]
    DataNotAvailable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("transient error: {0}")]
    Transient(String),
}

impl CoreError {
    /// Whether the pipeline may retry this failure through the LLM.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Validation(_))
    }

    /// Error-type tag used in execution results.
    pub fn error_type(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "config_error",
            CoreError::DataNotAvailable(_) => "data_not_available",
            CoreError::Validation(_) => "validation_error",
            CoreError::Execution(_) => "execution_error",
            CoreError::Transient(_) => "transient_error",
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CoreError::Transient(format!("request deadline exceeded: {}", e))
        } else {
            CoreError::Transient(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Transient(format!("JSON error: {}", e))
    }
}

//! Error types for Hypergraph

use std::fmt;

use thiserror::Error;

/// Result type alias using Hypergraph's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of transient provider failure (eligible for retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// The request timed out before the provider answered
    Timeout,
    /// The provider refused the request because of its own rate limits
    RateLimited {
        /// Suggested wait from the provider, if any
        retry_after_secs: Option<u64>,
    },
    /// 5xx-equivalent server failure
    ServerError { status: u16 },
    /// Connection could not be established or was reset
    Connection,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => write!(f, "rate limited (retry after {}s)", secs),
            Self::RateLimited { .. } => write!(f, "rate limited"),
            Self::ServerError { status } => write!(f, "server error {}", status),
            Self::Connection => write!(f, "connection failure"),
        }
    }
}

/// Hypergraph error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Provider errors (E100-E199)
    #[error("Transient provider error ({kind}): {message}")]
    TransientProvider { kind: TransientKind, message: String },

    #[error("Provider error: {0}")]
    TerminalProvider(String),

    #[error("Retries exhausted after {attempts} attempts. Last error: {last}")]
    ExhaustedRetries { attempts: u32, last: Box<Error> },

    #[error("Rate limit acquisition for '{instance}' exceeded its deadline of {waited_ms}ms")]
    RateLimitTimeout { instance: String, waited_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    // Graph errors (E200-E299)
    #[error("Graph extraction failed. No {table} detected during extraction.")]
    EmptyExtractionResult { table: String },

    #[error("Merge input inconsistency in table '{table}' at key '{key}': {detail}")]
    MergeInputInconsistency {
        table: String,
        key: String,
        detail: String,
    },

    #[error("Graph pruning failed. No {table} remain.")]
    EmptyPruneResult { table: String },

    // Workflow errors (E300-E399)
    #[error("Workflow '{workflow}' failed: {source}")]
    WorkflowFailed {
        workflow: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("{capability} strategy '{name}' is not registered. Registered strategies: {registered}")]
    UnknownStrategy {
        capability: &'static str,
        name: String,
        registered: String,
    },

    // Storage errors (E400-E499)
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cache error: {0}")]
    Cache(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a transient provider failure
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::TransientProvider {
            kind,
            message: message.into(),
        }
    }

    /// Whether the retrier should attempt the operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientProvider { .. })
    }

    /// Name of the workflow stage that failed, if known
    pub fn workflow(&self) -> Option<&str> {
        match self {
            Self::WorkflowFailed { workflow, .. } => Some(workflow),
            _ => None,
        }
    }

    /// Innermost error, unwrapping stage attribution
    pub fn root(&self) -> &Error {
        match self {
            Self::WorkflowFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Wrap this error with the workflow stage it occurred in
    pub fn in_workflow(self, workflow: impl Into<String>) -> Self {
        match self {
            already @ Self::WorkflowFailed { .. } => already,
            other => Self::WorkflowFailed {
                workflow: workflow.into(),
                source: Box::new(other),
            },
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientProvider { .. } => "E100",
            Self::TerminalProvider(_) => "E101",
            Self::ExhaustedRetries { .. } => "E102",
            Self::RateLimitTimeout { .. } => "E103",
            Self::Cancelled => "E104",
            Self::EmptyExtractionResult { .. } => "E200",
            Self::MergeInputInconsistency { .. } => "E201",
            Self::EmptyPruneResult { .. } => "E202",
            Self::WorkflowFailed { source, .. } => source.code(),
            Self::UnknownWorkflow(_) => "E301",
            Self::UnknownStrategy { .. } => "E302",
            Self::TableNotFound(_) => "E400",
            Self::Storage(_) => "E401",
            Self::Cache(_) => "E402",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Serialization(_) | Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ExhaustedRetries { .. } => {
                Some("Increase retry.max_attempts or lower concurrent_requests".to_string())
            }
            Self::RateLimitTimeout { instance, .. } => Some(format!(
                "Raise rate_limit.acquire_timeout_secs for model '{}'",
                instance
            )),
            Self::EmptyExtractionResult { .. } => {
                Some("Check the extraction prompt and the model's output format".to_string())
            }
            Self::EmptyPruneResult { .. } => {
                Some("Relax the prune_graph thresholds".to_string())
            }
            Self::UnknownWorkflow(_) => {
                Some("Check the `workflows` list in settings.toml".to_string())
            }
            Self::WorkflowFailed { source, .. } => source.suggestion(),
            _ => None,
        }
    }
}

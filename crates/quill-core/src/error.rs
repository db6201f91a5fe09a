//! Error types for quill-core

use thiserror::Error;

/// Main error type for quill-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Invalid task transition: {0}")]
    InvalidTransition(String),

    #[error("Edit rejected: {0}")]
    EditConflict(String),

    #[error("Path is outside the projected context: {0}")]
    ContextLeak(String),

    #[error("Skill validation failed: {0}")]
    SkillValidation(String),

    #[error("Skill conflict: {0}")]
    SkillConflict(String),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("Dependency degraded: {0}")]
    Degraded(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

/// Broad class of an error, used to decide whether a retry makes sense
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad goal, bad config, bad arguments. Reported, never retried.
    UserInput,
    /// Local storage or runtime failure. Retried with backoff.
    System,
    /// Tool server or LLM unreachable. Retried with backoff, then degraded.
    ExternalService,
    /// Programming or configuration errors that are fatal to the operation.
    BusinessLogic,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidInput(_) | Error::NotFound(_) | Error::Json(_) => {
                ErrorCategory::UserInput
            }
            Error::Database(_) | Error::Io(_) | Error::Other(_) => ErrorCategory::System,
            Error::LlmApi(_)
            | Error::Http(_)
            | Error::Mcp(_)
            | Error::ToolExecution(_)
            | Error::Degraded(_)
            | Error::Timeout(_) => ErrorCategory::ExternalService,
            Error::Planning(_)
            | Error::InvalidTransition(_)
            | Error::EditConflict(_)
            | Error::ContextLeak(_)
            | Error::SkillValidation(_)
            | Error::SkillConflict(_)
            | Error::Cancelled(_) => ErrorCategory::BusinessLogic,
        }
    }

    /// Whether a retry loop may try the operation again.
    ///
    /// A degraded dependency is excluded: its circuit breaker is already
    /// failing fast and retrying would only spin.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Degraded(_) => false,
            _ => matches!(
                self.category(),
                ErrorCategory::System | ErrorCategory::ExternalService
            ),
        }
    }
}

/// Result type alias for quill-core
pub type Result<T> = std::result::Result<T, Error>;

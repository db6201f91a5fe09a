//! Adapter errors

use thiserror::Error;

/// Failures specific to tool server connections
#[derive(Error, Debug)]
pub enum McpError {
    #[error("server '{server}' uses transport '{transport}', which cannot be connected yet")]
    UnsupportedTransport { server: String, transport: String },

    #[error("invalid server config '{server}': {reason}")]
    InvalidConfig { server: String, reason: String },

    #[error("failed to connect to '{server}': {reason}")]
    Connect { server: String, reason: String },

    #[error("server '{server}' degraded after {attempts} attempt(s): {reason}")]
    Degraded {
        server: String,
        attempts: u32,
        reason: String,
    },

    #[error("server '{0}' is failing fast until its cooldown elapses")]
    CircuitOpen(String),

    #[error("{tool} on '{server}' timed out after {secs}s")]
    Timeout {
        server: String,
        tool: String,
        secs: u64,
    },

    #[error("protocol error from '{server}': {reason}")]
    Protocol { server: String, reason: String },
}

impl From<McpError> for quill_core::Error {
    fn from(e: McpError) -> Self {
        match e {
            McpError::UnsupportedTransport { .. } | McpError::InvalidConfig { .. } => {
                quill_core::Error::Config(e.to_string())
            }
            McpError::Degraded { .. } | McpError::CircuitOpen(_) => quill_core::Error::Degraded(e.to_string()),
            McpError::Timeout { .. } => quill_core::Error::Timeout(e.to_string()),
            McpError::Connect { .. } | McpError::Protocol { .. } => quill_core::Error::Mcp(e.to_string()),
        }
    }
}

//! Tool trait definition
//!
//! Every invocable tool, whatever its origin, implements [`Tool`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::Result;

/// Tool execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Output string from tool execution
    pub output: String,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful tool result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Create an error tool result
    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// Tool trait
///
/// Implement this trait to expose something the model may call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name
    fn name(&self) -> &str;

    /// Get the tool description (shown to the model when selecting tools)
    fn description(&self) -> &str;

    /// Get the JSON schema for the tool's input parameters
    fn input_schema(&self) -> JsonValue;

    /// JSON schema of the structured output, when the tool declares one
    fn output_schema(&self) -> Option<JsonValue> {
        None
    }

    /// Execute the tool with the given input
    ///
    /// Tool-level failures (bad arguments, remote error text) come back as
    /// `ToolResult::error`; `Err` is reserved for transport and runtime faults.
    async fn execute(&self, input: JsonValue) -> Result<ToolResult>;
}

//! context_write: store a new version of an entry

use async_trait::async_trait;
use quill_core::{ContextStore, Result, Tool, ToolResult};
use serde_json::{Value, json};

use crate::{context_path, required_str};

/// Writes content as a new version
pub struct ContextWriteTool {
    store: ContextStore,
    writer: String,
}

impl ContextWriteTool {
    pub fn new(store: ContextStore, writer: &str) -> Self {
        Self {
            store,
            writer: writer.to_string(),
        }
    }
}

#[async_trait]
impl Tool for ContextWriteTool {
    fn name(&self) -> &str {
        "context_write"
    }

    fn description(&self) -> &str {
        "Write content to an entry in the writing context store. Every write creates a new version; nothing is overwritten."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Entry path, e.g. /drafts/chapter1.md"
                },
                "content": {
                    "type": "string",
                    "description": "The full content to store"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult> {
        let raw = required_str(&input, "path")?;
        let content = required_str(&input, "content")?;
        let path = match context_path(raw) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };

        tracing::debug!(path = %path, chars = content.len(), "Writing context entry");

        match self.store.write(&path, content, &self.writer).await {
            Ok(receipt) => Ok(ToolResult::success(format!(
                "Wrote {} version {} ({} chars{})",
                receipt.path,
                receipt.version,
                receipt.chars,
                if receipt.externalized {
                    ", stored externally"
                } else {
                    ""
                }
            ))),
            Err(e) => Ok(ToolResult::error(format!("Failed to write '{}': {}", path, e))),
        }
    }
}

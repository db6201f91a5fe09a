//! context_read: read a context entry

use async_trait::async_trait;
use quill_core::{ContextStore, Result, Tool, ToolResult};
use serde_json::{Value, json};

use crate::{context_path, required_str};

/// Reads an entry, optionally a past version or a line window of it
pub struct ContextReadTool {
    store: ContextStore,
}

impl ContextReadTool {
    pub fn new(store: ContextStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ContextReadTool {
    fn name(&self) -> &str {
        "context_read"
    }

    fn description(&self) -> &str {
        "Read an entry from the writing context store. Large entries can be read in windows with offset and limit."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Entry path, e.g. /drafts/chapter1.md"
                },
                "version": {
                    "type": "integer",
                    "description": "Version to read (default: latest)"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult> {
        let raw = required_str(&input, "path")?;
        let path = match context_path(raw) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };
        let version = input["version"].as_u64();
        let offset = input["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = input["limit"].as_u64().map(|l| l as usize);

        tracing::debug!(path = %path, version = ?version, offset, limit = ?limit, "Reading context entry");

        let entry = match self.store.read_entry(&path, version).await {
            Ok(e) => e,
            Err(e) => return Ok(ToolResult::error(format!("Failed to read '{}': {}", path, e))),
        };

        let lines: Vec<&str> = entry.content.lines().collect();
        let start = offset - 1;
        if start >= lines.len() && !lines.is_empty() {
            return Ok(ToolResult::success("(empty or beyond end of entry)".to_string()));
        }
        let end = match limit {
            Some(l) => (start + l).min(lines.len()),
            None => lines.len(),
        };

        let body = lines[start.min(lines.len())..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>5}\t{}", start + i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolResult::success(format!(
            "{} (version {}, lines {}-{} of {})\n{}",
            path,
            entry.version,
            start + 1,
            end,
            lines.len(),
            body
        )))
    }
}

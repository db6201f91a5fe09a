//! context_grep: regex search over context entries

use async_trait::async_trait;
use quill_core::{ContextStore, Result, Tool, ToolResult};
use serde_json::{Value, json};

use crate::required_str;

const MAX_MATCHES: usize = 200;

/// Searches the latest version of every entry under a prefix
pub struct ContextGrepTool {
    store: ContextStore,
}

impl ContextGrepTool {
    pub fn new(store: ContextStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ContextGrepTool {
    fn name(&self) -> &str {
        "context_grep"
    }

    fn description(&self) -> &str {
        "Search entries of the writing context store with a case-insensitive regular expression"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "The regular expression pattern to search for"
                },
                "prefix": {
                    "type": "string",
                    "description": "Path prefix to limit the search (default: everything)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult> {
        let pattern = required_str(&input, "pattern")?;
        let prefix = input["prefix"].as_str().unwrap_or("/");

        tracing::debug!(pattern = %pattern, prefix = %prefix, "Grepping context entries");

        let matches = match self.store.grep(pattern, prefix).await {
            Ok(m) => m,
            Err(e) => return Ok(ToolResult::error(e.to_string())),
        };
        if matches.is_empty() {
            return Ok(ToolResult::success("No matches found"));
        }

        let mut lines: Vec<String> = matches
            .iter()
            .take(MAX_MATCHES)
            .map(|m| format!("{}:{}: {}", m.path, m.line, m.text))
            .collect();
        if matches.len() > MAX_MATCHES {
            lines.push(format!("... {} more matches", matches.len() - MAX_MATCHES));
        }
        Ok(ToolResult::success(lines.join("\n")))
    }
}

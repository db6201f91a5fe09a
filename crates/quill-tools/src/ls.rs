//! context_ls: list context entries

use async_trait::async_trait;
use quill_core::{ContextStore, Result, Tool, ToolResult};
use serde_json::{Value, json};

/// Lists entries under a prefix with their latest version and size
pub struct ContextLsTool {
    store: ContextStore,
}

impl ContextLsTool {
    pub fn new(store: ContextStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for ContextLsTool {
    fn name(&self) -> &str {
        "context_ls"
    }

    fn description(&self) -> &str {
        "List entries in the writing context store, optionally under a path prefix such as /drafts"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prefix": {
                    "type": "string",
                    "description": "Path prefix to list (default: everything)"
                }
            }
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult> {
        let prefix = input["prefix"].as_str().unwrap_or("/");
        tracing::debug!(prefix = %prefix, "Listing context entries");

        let lines: Vec<String> = self
            .store
            .list(prefix)
            .into_iter()
            .filter_map(|path| {
                let latest = self.store.versions(&path).ok()?.pop()?;
                Some(format!(
                    "{} (v{}, {} chars)",
                    path, latest.version, latest.chars
                ))
            })
            .collect();

        if lines.is_empty() {
            Ok(ToolResult::success(format!("No entries under {}", prefix)))
        } else {
            Ok(ToolResult::success(lines.join("\n")))
        }
    }
}

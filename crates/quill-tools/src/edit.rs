//! context_edit: batched line edits

use async_trait::async_trait;
use quill_core::{ContextStore, Error, LineEdit, Result, Tool, ToolResult};
use serde_json::{Value, json};

use crate::{context_path, required_str};

/// Applies a batch of line-range replacements as one new version
pub struct ContextEditTool {
    store: ContextStore,
    writer: String,
}

impl ContextEditTool {
    pub fn new(store: ContextStore, writer: &str) -> Self {
        Self {
            store,
            writer: writer.to_string(),
        }
    }
}

#[async_trait]
impl Tool for ContextEditTool {
    fn name(&self) -> &str {
        "context_edit"
    }

    fn description(&self) -> &str {
        "Replace line ranges of an entry in one atomic edit. Line numbers are 1-based and inclusive, refer to the current version, and ranges must not overlap. An empty new_content deletes the range."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Entry path"
                },
                "edits": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "start_line": {"type": "integer"},
                            "end_line": {"type": "integer"},
                            "new_content": {"type": "string"}
                        },
                        "required": ["start_line", "end_line"]
                    }
                }
            },
            "required": ["path", "edits"]
        })
    }

    async fn execute(&self, input: Value) -> Result<ToolResult> {
        let raw = required_str(&input, "path")?;
        let edits: Vec<LineEdit> = match input.get("edits") {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::ToolExecution(format!("Invalid 'edits' parameter: {}", e)))?,
            None => return Err(Error::ToolExecution("Missing 'edits' parameter".to_string())),
        };
        let path = match context_path(raw) {
            Ok(p) => p,
            Err(result) => return Ok(result),
        };

        tracing::debug!(path = %path, edits = edits.len(), "Editing context entry");

        match self.store.edit(&path, &edits, &self.writer).await {
            Ok(version) => Ok(ToolResult::success(format!(
                "Applied {} edit(s) to {}, now version {}",
                edits.len(),
                path,
                version
            ))),
            Err(e) => Ok(ToolResult::error(format!("Edit of '{}' rejected: {}", path, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::ContextPath;

    async fn setup() -> (tempfile::TempDir, ContextStore, ContextEditTool) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::open(dir.path(), 1000).unwrap();
        store
            .write(&ContextPath::parse("/drafts/a.md").unwrap(), "l1\nl2\nl3\nl4\n", "user")
            .await
            .unwrap();
        let tool = ContextEditTool::new(store.clone(), "model");
        (dir, store, tool)
    }

    #[tokio::test]
    async fn test_batch_edit() {
        let (_dir, store, tool) = setup().await;
        let result = tool
            .execute(json!({
                "path": "/drafts/a.md",
                "edits": [
                    {"start_line": 1, "end_line": 1, "new_content": "first"},
                    {"start_line": 3, "end_line": 4}
                ]
            }))
            .await
            .unwrap();

        assert!(!result.is_error, "{}", result.output);
        let path = ContextPath::parse("/drafts/a.md").unwrap();
        assert_eq!(store.read(&path, None).await.unwrap(), "first\nl2\n");
    }

    #[tokio::test]
    async fn test_overlapping_edits_leave_no_version() {
        let (_dir, store, tool) = setup().await;
        let result = tool
            .execute(json!({
                "path": "/drafts/a.md",
                "edits": [
                    {"start_line": 1, "end_line": 2, "new_content": "x"},
                    {"start_line": 2, "end_line": 3, "new_content": "y"}
                ]
            }))
            .await
            .unwrap();

        assert!(result.is_error);
        let path = ContextPath::parse("/drafts/a.md").unwrap();
        assert_eq!(store.versions(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_edits() {
        let (_dir, _store, tool) = setup().await;
        assert!(tool
            .execute(json!({"path": "/drafts/a.md", "edits": "nope"}))
            .await
            .is_err());
    }
}

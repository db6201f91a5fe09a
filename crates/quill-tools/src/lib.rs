//! quill-tools: Built-in tools for quill
//!
//! The model reaches the context store only through these tools, so large
//! artifacts stay out of prompts and are read back on demand.

use std::sync::Arc;

use quill_core::{ContextPath, ContextStore, Error, Result, ToolManager, ToolResult};
use serde_json::Value;

pub mod edit;
pub mod grep;
pub mod ls;
pub mod read;
pub mod write;

pub use edit::ContextEditTool;
pub use grep::ContextGrepTool;
pub use ls::ContextLsTool;
pub use read::ContextReadTool;
pub use write::ContextWriteTool;

/// Register the context tools; writes are attributed to `writer`
pub fn register_context_tools(manager: &mut ToolManager, store: ContextStore, writer: &str) {
    manager.register_builtin(Arc::new(ContextLsTool::new(store.clone())));
    manager.register_builtin(Arc::new(ContextReadTool::new(store.clone())));
    manager.register_builtin(Arc::new(ContextWriteTool::new(store.clone(), writer)));
    manager.register_builtin(Arc::new(ContextEditTool::new(store.clone(), writer)));
    manager.register_builtin(Arc::new(ContextGrepTool::new(store)));
}

pub(crate) fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str> {
    input[key]
        .as_str()
        .ok_or_else(|| Error::ToolExecution(format!("Missing '{}' parameter", key)))
}

/// Parse a path argument; a malformed path is the model's mistake, not ours
pub(crate) fn context_path(raw: &str) -> std::result::Result<ContextPath, ToolResult> {
    ContextPath::parse(raw).map_err(|e| ToolResult::error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_context_tools() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::open(dir.path(), 100).unwrap();
        let mut manager = ToolManager::new();
        register_context_tools(&mut manager, store, "model");

        assert_eq!(
            manager.tool_names(),
            vec!["context_edit", "context_grep", "context_ls", "context_read", "context_write"]
        );

        manager
            .execute("context_write", json!({"path": "/drafts/a.md", "content": "hello"}))
            .await
            .unwrap();
        let read = manager
            .execute("context_read", json!({"path": "/drafts/a.md"}))
            .await
            .unwrap();
        assert!(read.output.contains("hello"));
    }
}

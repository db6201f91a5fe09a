//! Tool manager for registering and executing tools

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::tool::{InternalTool, Tool, ToolOrigin, ToolResult};
use crate::{Error, Result};

/// Tool definition as presented to the model
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: JsonValue,
}

/// Manager for registered tools
///
/// Handles tool registration, retrieval, and execution.
pub struct ToolManager {
    /// Registered tools indexed by name
    tools: HashMap<String, InternalTool>,
}

impl ToolManager {
    /// Create a new empty tool manager
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, returning the one it replaced
    pub fn register(&mut self, tool: InternalTool) -> Option<InternalTool> {
        let replaced = self.tools.insert(tool.name().to_string(), tool);
        if let Some(old) = &replaced {
            warn!(tool = old.name(), origin = ?old.origin(), "Tool replaced by a newer registration");
        }
        replaced
    }

    /// Register a built-in tool
    pub fn register_builtin(&mut self, tool: Arc<dyn Tool>) {
        self.register(InternalTool::builtin(tool));
    }

    /// Remove a tool by name
    pub fn unregister(&mut self, name: &str) -> Option<InternalTool> {
        self.tools.remove(name)
    }

    /// Remove every tool with the given origin, returning their names
    pub fn unregister_origin(&mut self, origin: &ToolOrigin) -> Vec<String> {
        let names: Vec<String> = self
            .tools
            .values()
            .filter(|t| &t.origin() == origin)
            .map(|t| t.name().to_string())
            .collect();
        for name in &names {
            self.tools.remove(name);
        }
        names
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<InternalTool> {
        self.tools.get(name).cloned()
    }

    /// All registered tool definitions, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name
    pub async fn execute(&self, name: &str, input: JsonValue) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown tool: {}", name)))?;
        debug!(tool = name, origin = ?tool.origin(), "Executing tool");
        tool.invoke(input).await
    }

    /// Execute a tool by name, failing with `Error::Timeout` past `timeout`
    pub async fn execute_with_timeout(
        &self,
        name: &str,
        input: JsonValue,
        timeout: Duration,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Unknown tool: {}", name)))?;
        match tokio::time::timeout(timeout, tool.invoke(input)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "tool {} exceeded {}ms",
                name,
                timeout.as_millis()
            ))),
        }
    }

    /// Check if a tool is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get the number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if no tools are registered
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get all registered tool names, sorted
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ToolManager {
    fn default() -> Self {
        Self::new()
    }
}

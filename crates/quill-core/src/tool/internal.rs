//! Unified tool variant
//!
//! Remote tool servers and skill packages both produce [`InternalTool`]s, so
//! callers dispatch on the name alone.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use super::{Tool, ToolResult};
use crate::Result;

/// Where a tool came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOrigin {
    Builtin,
    Remote { server: String },
    Skill { skill: String },
}

/// A registered tool tagged with its origin
#[derive(Clone)]
pub enum InternalTool {
    /// Shipped with the crate
    Builtin(Arc<dyn Tool>),
    /// Reached through a tool server connection
    Remote { server: String, tool: Arc<dyn Tool> },
    /// Exposed by an active skill package
    Skill { skill: String, tool: Arc<dyn Tool> },
}

impl InternalTool {
    pub fn builtin(tool: Arc<dyn Tool>) -> Self {
        InternalTool::Builtin(tool)
    }

    pub fn remote(server: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        InternalTool::Remote {
            server: server.into(),
            tool,
        }
    }

    pub fn skill(skill: impl Into<String>, tool: Arc<dyn Tool>) -> Self {
        InternalTool::Skill {
            skill: skill.into(),
            tool,
        }
    }

    fn inner(&self) -> &Arc<dyn Tool> {
        match self {
            InternalTool::Builtin(tool)
            | InternalTool::Remote { tool, .. }
            | InternalTool::Skill { tool, .. } => tool,
        }
    }

    pub fn name(&self) -> &str {
        self.inner().name()
    }

    pub fn description(&self) -> &str {
        self.inner().description()
    }

    pub fn input_schema(&self) -> JsonValue {
        self.inner().input_schema()
    }

    pub fn output_schema(&self) -> Option<JsonValue> {
        self.inner().output_schema()
    }

    pub fn origin(&self) -> ToolOrigin {
        match self {
            InternalTool::Builtin(_) => ToolOrigin::Builtin,
            InternalTool::Remote { server, .. } => ToolOrigin::Remote {
                server: server.clone(),
            },
            InternalTool::Skill { skill, .. } => ToolOrigin::Skill {
                skill: skill.clone(),
            },
        }
    }

    /// Invoke the tool; arguments are forwarded untouched
    pub async fn invoke(&self, args: JsonValue) -> Result<ToolResult> {
        self.inner().execute(args).await
    }
}

impl std::fmt::Debug for InternalTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalTool")
            .field("name", &self.name())
            .field("origin", &self.origin())
            .finish()
    }
}

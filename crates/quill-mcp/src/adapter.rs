//! MCP Tool Adapter
//!
//! サーバーのツールを InternalTool に変換するアダプター

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use quill_core::{Error, InternalTool, Result, Tool, ToolResult};

use crate::client::ToolDescriptor;
use crate::connection::ServerConnection;

/// Makes one remote tool callable through the tool manager
///
/// Name, description and schemas are kept verbatim and arguments are
/// forwarded unchanged.
pub struct McpToolAdapter {
    connection: Arc<ServerConnection>,
    descriptor: ToolDescriptor,
}

impl McpToolAdapter {
    pub fn new(connection: Arc<ServerConnection>, descriptor: ToolDescriptor) -> Self {
        Self {
            connection,
            descriptor,
        }
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn input_schema(&self) -> JsonValue {
        self.descriptor.input_schema.clone()
    }

    fn output_schema(&self) -> Option<JsonValue> {
        self.descriptor.output_schema.clone()
    }

    async fn execute(&self, input: JsonValue) -> Result<ToolResult> {
        match self.connection.call(&self.descriptor.name, input).await {
            Ok(result) => Ok(result),
            // the orchestrator needs to see a degraded server
            Err(e @ Error::Degraded(_)) => Err(e),
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

/// Wrap a descriptor as a remote [`InternalTool`]
pub fn translate(connection: Arc<ServerConnection>, descriptor: ToolDescriptor) -> InternalTool {
    let server = descriptor.server.clone();
    InternalTool::remote(server, Arc::new(McpToolAdapter::new(connection, descriptor)))
}

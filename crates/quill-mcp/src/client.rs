//! MCP sessions
//!
//! rmcp を使用した子プロセス接続と、テスト用に差し替え可能なトレイト

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParams, RawContent, Tool},
    service::{Peer, RoleClient, RunningService, ServiceExt},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use quill_core::{Result, ToolResult};

use crate::config::{ToolServerConfig, Transport};
use crate::error::McpError;

/// A tool as advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    pub description: String,
    /// JSON schema for input parameters, kept exactly as the server sent it
    pub input_schema: JsonValue,
    pub output_schema: Option<JsonValue>,
}

impl ToolDescriptor {
    fn from_rmcp(server: &str, tool: Tool) -> Self {
        // camelCase keys as on the wire
        let raw = serde_json::to_value(&tool).unwrap_or(JsonValue::Null);
        Self {
            server: server.to_string(),
            name: tool.name.to_string(),
            description: tool.description.clone().unwrap_or_default().to_string(),
            input_schema: serde_json::to_value(&tool.input_schema).unwrap_or(JsonValue::Null),
            output_schema: raw.get("outputSchema").filter(|v| !v.is_null()).cloned(),
        }
    }
}

/// A live connection to one tool server
#[async_trait]
pub trait McpSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Call a tool; arguments are forwarded untouched
    async fn call_tool(&self, name: &str, args: JsonValue) -> Result<ToolResult>;

    async fn close(&self) -> Result<()>;
}

/// Opens sessions for server configs
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn McpSession>>;
}

/// Session over an rmcp child process
pub struct RmcpSession {
    server: String,
    peer: Peer<RoleClient>,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl RmcpSession {
    /// Start the server process and complete the handshake
    pub async fn spawn(config: &ToolServerConfig) -> Result<Self> {
        let argv = config.argv();
        let (program, args) = argv.split_first().ok_or_else(|| McpError::InvalidConfig {
            server: config.name.clone(),
            reason: "empty command".into(),
        })?;

        let transport = TokioChildProcess::new(Command::new(program).configure(|c| {
            c.args(args);
            c.envs(&config.env);
        }))
        .map_err(|e| McpError::Connect {
            server: config.name.clone(),
            reason: format!("failed to create transport: {}", e),
        })?;

        // Serve with unit type handler (client-only mode)
        let service = ().serve(transport).await.map_err(|e| McpError::Connect {
            server: config.name.clone(),
            reason: e.to_string(),
        })?;

        if let Some(info) = service.peer_info() {
            debug!(
                server_name = %config.name,
                reported_name = %info.server_info.name,
                "MCP handshake complete"
            );
        }

        Ok(Self {
            server: config.name.clone(),
            peer: service.peer().clone(),
            service: Mutex::new(Some(service)),
        })
    }
}

#[async_trait]
impl McpSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let result = self
            .peer
            .list_tools(Default::default())
            .await
            .map_err(|e| McpError::Protocol {
                server: self.server.clone(),
                reason: format!("failed to list tools: {}", e),
            })?;

        Ok(result
            .tools
            .into_iter()
            .map(|t| ToolDescriptor::from_rmcp(&self.server, t))
            .collect())
    }

    async fn call_tool(&self, name: &str, args: JsonValue) -> Result<ToolResult> {
        let result = self
            .peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_string().into(),
                arguments: args.as_object().cloned(),
                task: None,
            })
            .await
            .map_err(|e| McpError::Protocol {
                server: self.server.clone(),
                reason: format!("tool call failed: {}", e),
            })?;

        // Extract text content from the result
        let output = result
            .content
            .into_iter()
            .filter_map(|c| match c.raw {
                RawContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error.unwrap_or(false) {
            Ok(ToolResult::error(output))
        } else {
            Ok(ToolResult::success(output))
        }
    }

    async fn close(&self) -> Result<()> {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            service.cancel().await.map_err(|e| McpError::Protocol {
                server: self.server.clone(),
                reason: format!("shutdown failed: {}", e),
            })?;
        }
        Ok(())
    }
}

/// Connector for real servers
#[derive(Debug, Default, Clone, Copy)]
pub struct RmcpConnector;

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn McpSession>> {
        match config.transport {
            Transport::Stdio => Ok(Arc::new(RmcpSession::spawn(config).await?)),
            Transport::Http | Transport::Ws => Err(McpError::UnsupportedTransport {
                server: config.name.clone(),
                transport: config.transport.to_string(),
            }
            .into()),
        }
    }
}

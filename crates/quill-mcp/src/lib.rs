//! quill-mcp: Tool Protocol Adapter
//!
//! MCPサーバーへの接続を管理し、公開されたツールを quill-core の
//! InternalTool に変換します。

pub mod adapter;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;

pub use adapter::{McpToolAdapter, translate};
pub use client::{Connector, McpSession, RmcpConnector, RmcpSession, ToolDescriptor};
pub use config::{AuthType, Credentials, ToolServerConfig, ToolServersConfig, Transport, discover};
pub use connection::{ConnectionState, ServerConnection};
pub use error::McpError;
pub use registry::{McpRegistry, initialize_mcp_tools};

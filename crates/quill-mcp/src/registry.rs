//! MCP Registry
//!
//! サーバー接続とツール登録の一元管理

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use quill_core::{McpConfig, Result, ToolManager, ToolOrigin};

use crate::adapter::translate;
use crate::client::{Connector, RmcpConnector};
use crate::config::{ToolServerConfig, discover};
use crate::connection::{ConnectionState, ServerConnection};

/// Live tool server connections, one per configured server
pub struct McpRegistry {
    connector: Arc<dyn Connector>,
    connections: BTreeMap<String, Arc<ServerConnection>>,
}

impl McpRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: BTreeMap::new(),
        }
    }

    /// Connect to every server concurrently and register the tools of those that answer
    ///
    /// A server that cannot be reached stays in the registry with its error or
    /// degraded state; other servers are unaffected.
    pub async fn initialize(
        servers: Vec<ToolServerConfig>,
        connector: Arc<dyn Connector>,
        tool_manager: &mut ToolManager,
    ) -> Self {
        let mut registry = Self::new(connector);
        if servers.is_empty() {
            info!("No MCP servers configured");
            return registry;
        }

        let connections: Vec<Arc<ServerConnection>> = servers
            .into_iter()
            .map(|config| Arc::new(ServerConnection::new(config, registry.connector.clone())))
            .collect();

        let results = join_all(connections.iter().map(|c| c.connect())).await;

        let mut total_tools = 0;
        for (conn, result) in connections.into_iter().zip(results) {
            match result {
                Ok(()) => total_tools += Self::register_tools(&conn, tool_manager),
                Err(e) => warn!(
                    server_name = %conn.name(),
                    error = %e,
                    "Skipping MCP server due to connection error"
                ),
            }
            registry.connections.insert(conn.name().to_string(), conn);
        }

        info!(
            server_count = registry.connections.len(),
            connected = registry.connections.values().filter(|c| c.state().is_connected()).count(),
            total_tools,
            "MCP registry initialized"
        );
        registry
    }

    fn register_tools(conn: &Arc<ServerConnection>, tool_manager: &mut ToolManager) -> usize {
        let tools = conn.tools();
        for descriptor in &tools {
            info!(server_name = %conn.name(), tool_name = %descriptor.name, "Registered MCP tool");
            tool_manager.register(translate(conn.clone(), descriptor.clone()));
        }
        tools.len()
    }

    /// Add (or replace) a server and register its tools
    pub async fn add_server(&mut self, config: ToolServerConfig, tool_manager: &mut ToolManager) -> Result<usize> {
        config.validate()?;
        if self.connections.contains_key(&config.name) {
            self.remove_server(&config.name, tool_manager).await;
        }

        let conn = Arc::new(ServerConnection::new(config, self.connector.clone()));
        self.connections.insert(conn.name().to_string(), conn.clone());
        conn.connect().await?;
        Ok(Self::register_tools(&conn, tool_manager))
    }

    /// Unregister a server's tools and close its connection
    pub async fn remove_server(&mut self, name: &str, tool_manager: &mut ToolManager) -> bool {
        let Some(conn) = self.connections.remove(name) else {
            return false;
        };
        let removed = tool_manager.unregister_origin(&ToolOrigin::Remote {
            server: name.to_string(),
        });
        if let Err(e) = conn.disconnect().await {
            warn!(server_name = %name, error = %e, "Failed to close MCP connection");
        }
        info!(server_name = %name, tools = removed.len(), "MCP server removed");
        true
    }

    pub fn connection(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.connections.get(name).cloned()
    }

    /// Server configs, sorted by name
    pub fn configs(&self) -> Vec<ToolServerConfig> {
        self.connections.values().map(|c| c.config().clone()).collect()
    }

    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        self.connections
            .iter()
            .map(|(name, c)| (name.clone(), c.state()))
            .collect()
    }

    pub fn degraded_servers(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|(_, c)| c.state().is_degraded())
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection concurrently
    pub async fn shutdown(&self) {
        info!("Shutting down MCP registry");
        let results = join_all(self.connections.values().map(|c| c.disconnect())).await;
        for (name, result) in self.connections.keys().zip(results) {
            if let Err(e) = result {
                warn!(server_name = %name, error = %e, "Failed to shutdown MCP client");
            }
        }
        info!("MCP registry shutdown complete");
    }
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new(Arc::new(RmcpConnector))
    }
}

/// Discover configured servers, connect them and register their tools
pub async fn initialize_mcp_tools(config: &McpConfig, tool_manager: &mut ToolManager) -> Result<McpRegistry> {
    let servers = discover(config)?;
    Ok(McpRegistry::initialize(servers, Arc::new(RmcpConnector), tool_manager).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{FakeConnector, fast_config};
    use async_trait::async_trait;
    use quill_core::Error;

    /// Routes by server name so one server can fail while the other works
    struct RoutingConnector {
        healthy: FakeConnector,
        broken: FakeConnector,
    }

    #[async_trait]
    impl Connector for RoutingConnector {
        async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn crate::client::McpSession>> {
            if config.name == "broken" {
                self.broken.connect(config).await
            } else {
                self.healthy.connect(config).await
            }
        }
    }

    fn routing() -> Arc<RoutingConnector> {
        Arc::new(RoutingConnector {
            healthy: FakeConnector::new("glossary", 0),
            broken: FakeConnector::new("broken", u32::MAX),
        })
    }

    #[test]
    fn test_registry_default() {
        let registry = McpRegistry::default();
        assert_eq!(registry.server_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_server_does_not_block_others() {
        let mut tools = ToolManager::new();
        let registry = McpRegistry::initialize(
            vec![fast_config("glossary"), fast_config("broken")],
            routing(),
            &mut tools,
        )
        .await;

        assert_eq!(registry.server_count(), 2);
        assert_eq!(registry.degraded_servers(), vec!["broken".to_string()]);
        assert!(tools.contains("lookup"));

        let result = tools
            .execute("lookup", serde_json::json!({"term": "sonnet"}))
            .await
            .unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn test_remove_server_unregisters_tools() {
        let mut tools = ToolManager::new();
        let mut registry = McpRegistry::new(routing());
        assert_eq!(registry.add_server(fast_config("glossary"), &mut tools).await.unwrap(), 1);

        assert!(registry.remove_server("glossary", &mut tools).await);
        assert!(!tools.contains("lookup"));
        assert!(registry.connection("glossary").is_none());
        assert!(!registry.remove_server("glossary", &mut tools).await);
    }

    #[tokio::test]
    async fn test_add_invalid_server() {
        let mut tools = ToolManager::new();
        let mut registry = McpRegistry::new(routing());
        let err = registry
            .add_server(ToolServerConfig::stdio("bad name", "x"), &mut tools)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let mut tools = ToolManager::new();
        let registry = McpRegistry::initialize(vec![fast_config("glossary")], routing(), &mut tools).await;
        registry.shutdown().await;
        assert_eq!(
            registry.states(),
            vec![("glossary".to_string(), ConnectionState::Disconnected)]
        );
    }
}

//! Per-server connection state machine
//!
//! ```text
//! disconnected -> connecting -> connected -> disconnected (clean close)
//!                     |             |
//!                     v             v
//!                   error  <--------+
//!                     |
//!                     v  (retries exhausted)
//!                  degraded
//! ```
//!
//! Each server owns its own locks and breaker, so one slow or dead server
//! never blocks another.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use quill_core::{CircuitBreaker, CircuitState, Result, ToolResult};

use crate::client::{Connector, McpSession, ToolDescriptor};
use crate::config::ToolServerConfig;
use crate::error::McpError;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
    /// Retries exhausted; calls fail fast until the cooldown elapses
    Degraded(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ConnectionState::Degraded(_))
    }
}

pub struct ServerConnection {
    config: ToolServerConfig,
    connector: Arc<dyn Connector>,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<Arc<dyn McpSession>>>,
    /// Cached tool list of the live connection
    tools: RwLock<Vec<ToolDescriptor>>,
    breaker: CircuitBreaker,
    /// Serializes connection attempts
    connect_lock: Mutex<()>,
}

impl ServerConnection {
    pub fn new(config: ToolServerConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_cooldown(config, connector, DEFAULT_COOLDOWN)
    }

    pub fn with_cooldown(config: ToolServerConfig, connector: Arc<dyn Connector>, cooldown: Duration) -> Self {
        let breaker = CircuitBreaker::new(
            format!("mcp:{}", config.name),
            config.retry_policy.max_attempts.max(1),
            cooldown,
        );
        Self {
            config,
            connector,
            state: RwLock::new(ConnectionState::Disconnected),
            session: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            breaker,
            connect_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(server_name = %self.config.name, state = ?state, "Connection state changed");
        *self.state.write().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn current_session(&self) -> Option<Arc<dyn McpSession>> {
        self.session.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn replace_session(&self, session: Option<Arc<dyn McpSession>>) -> Option<Arc<dyn McpSession>> {
        std::mem::replace(&mut *self.session.write().unwrap_or_else(|p| p.into_inner()), session)
    }

    /// Cached descriptors from the last successful listing
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Connect, retrying with backoff when `auto_reconnect` is set
    ///
    /// Exhausting the attempts leaves the server degraded and opens its breaker.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.state().is_connected() && self.current_session().is_some() {
            return Ok(());
        }

        let policy = &self.config.retry_policy;
        let attempts = if self.config.auto_reconnect {
            policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.set_state(ConnectionState::Connecting);
            info!(server_name = %self.config.name, attempt, "Connecting to MCP server");

            match self.open_session().await {
                Ok(()) => {
                    self.breaker.record_success();
                    self.set_state(ConnectionState::Connected);
                    info!(
                        server_name = %self.config.name,
                        tool_count = self.tools().len(),
                        "MCP server connected"
                    );
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    warn!(server_name = %self.config.name, error = %e, "MCP server cannot be connected");
                    self.set_state(ConnectionState::Error(e.to_string()));
                    return Err(e);
                }
                Err(e) if attempt >= attempts => {
                    let degraded = McpError::Degraded {
                        server: self.config.name.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    };
                    warn!(server_name = %self.config.name, attempts = attempt, error = %e, "MCP server degraded");
                    self.set_state(ConnectionState::Degraded(e.to_string()));
                    self.breaker.trip();
                    return Err(degraded.into());
                }
                Err(e) => {
                    self.set_state(ConnectionState::Error(e.to_string()));
                    let delay = policy.delay_for(attempt - 1);
                    warn!(
                        server_name = %self.config.name,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "MCP connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn open_session(&self) -> Result<()> {
        let session = self.connector.connect(&self.config).await?;
        let tools = match session.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    debug!(server_name = %self.config.name, error = %close_err, "Close after failed listing");
                }
                return Err(e);
            }
        };
        *self.tools.write().unwrap_or_else(|p| p.into_inner()) = tools;
        self.replace_session(Some(session));
        Ok(())
    }

    /// Re-read the tool list from the live session
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let session = self.current_session().ok_or_else(|| McpError::Connect {
            server: self.config.name.clone(),
            reason: "not connected".into(),
        })?;
        let tools = session.list_tools().await?;
        *self.tools.write().unwrap_or_else(|p| p.into_inner()) = tools.clone();
        Ok(tools)
    }

    /// Call a tool on this server under the per-call timeout
    pub async fn call(&self, tool: &str, args: JsonValue) -> Result<ToolResult> {
        if !self.breaker.allow() {
            return Err(McpError::CircuitOpen(self.config.name.clone()).into());
        }

        let session = match self.current_session() {
            Some(s) => s,
            None => {
                self.connect().await?;
                self.current_session().ok_or_else(|| McpError::Connect {
                    server: self.config.name.clone(),
                    reason: "connection closed".into(),
                })?
            }
        };

        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, session.call_tool(tool, args)).await {
            Ok(Ok(result)) => {
                self.breaker.record_success();
                Ok(result)
            }
            Ok(Err(e)) => {
                warn!(server_name = %self.config.name, tool, error = %e, "MCP tool call failed");
                if e.is_retryable() {
                    self.breaker.record_failure();
                    self.replace_session(None);
                    self.set_state(ConnectionState::Error(e.to_string()));
                    if self.config.auto_reconnect {
                        // exhausted reconnects surface as Degraded instead of the call error
                        self.connect().await?;
                    }
                }
                Err(e)
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(McpError::Timeout {
                    server: self.config.name.clone(),
                    tool: tool.to_string(),
                    secs: timeout.as_secs(),
                }
                .into())
            }
        }
    }

    /// Close the session cleanly
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        let session = self.replace_session(None);
        let result = match session {
            Some(s) => s.close().await,
            None => Ok(()),
        };
        self.set_state(ConnectionState::Disconnected);
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use quill_core::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) struct FakeSession {
        pub server: String,
        pub calls: std::sync::Mutex<Vec<(String, JsonValue)>>,
        pub closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl McpSession for FakeSession {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
            Ok(vec![ToolDescriptor {
                server: self.server.clone(),
                name: "lookup".into(),
                description: "Look a term up".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"term": {"type": "string"}},
                    "required": ["term"]
                }),
                output_schema: Some(serde_json::json!({"type": "string"})),
            }])
        }

        async fn call_tool(&self, name: &str, args: JsonValue) -> Result<ToolResult> {
            self.calls.lock().unwrap().push((name.to_string(), args.clone()));
            Ok(ToolResult::success(format!("{} -> {}", name, args)))
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails the first `failures` attempts, then hands out one shared session
    pub(crate) struct FakeConnector {
        pub failures: u32,
        pub attempts: AtomicU32,
        pub session: Arc<FakeSession>,
    }

    impl FakeConnector {
        pub fn new(server: &str, failures: u32) -> Self {
            Self {
                failures,
                attempts: AtomicU32::new(0),
                session: Arc::new(FakeSession {
                    server: server.to_string(),
                    calls: std::sync::Mutex::new(Vec::new()),
                    closed: std::sync::atomic::AtomicBool::new(false),
                }),
            }
        }
    }

    #[async_trait::async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn McpSession>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(McpError::Connect {
                    server: config.name.clone(),
                    reason: format!("refused (attempt {})", n),
                }
                .into());
            }
            Ok(self.session.clone())
        }
    }

    pub(crate) fn fast_config(name: &str) -> ToolServerConfig {
        let mut config = ToolServerConfig::stdio(name, "fake-server");
        config.retry_policy = RetryPolicy::new(3, Duration::from_millis(1)).without_jitter();
        config
    }

    #[tokio::test]
    async fn test_three_failed_attempts_degrade() {
        let connector = Arc::new(FakeConnector::new("notes", u32::MAX));
        let conn = ServerConnection::new(fast_config("notes"), connector.clone());

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, quill_core::Error::Degraded(_)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(conn.state().is_degraded());
        assert_eq!(conn.circuit_state(), CircuitState::Open);

        // fails fast without another connection attempt
        let call = conn.call("lookup", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(call, quill_core::Error::Degraded(_)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_within_attempts() {
        let connector = Arc::new(FakeConnector::new("notes", 2));
        let conn = ServerConnection::new(fast_config("notes"), connector.clone());

        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.tools().len(), 1);
        assert_eq!(conn.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_no_auto_reconnect_tries_once() {
        let connector = Arc::new(FakeConnector::new("notes", 1));
        let mut config = fast_config("notes");
        config.auto_reconnect = false;
        let conn = ServerConnection::new(config, connector.clone());

        assert!(conn.connect().await.is_err());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(conn.state().is_degraded());
    }

    #[tokio::test]
    async fn test_breaker_half_opens_after_cooldown() {
        let connector = Arc::new(FakeConnector::new("notes", 3));
        let conn = ServerConnection::with_cooldown(fast_config("notes"), connector.clone(), Duration::from_millis(20));

        assert!(conn.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = conn.call("lookup", serde_json::json!({"term": "kenning"})).await.unwrap();
        assert!(!result.is_error);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    /// Session whose pipe breaks on every call
    struct BrokenPipe;

    #[async_trait::async_trait]
    impl McpSession for BrokenPipe {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
            Ok(Vec::new())
        }

        async fn call_tool(&self, _name: &str, _args: JsonValue) -> Result<ToolResult> {
            Err(McpError::Connect {
                server: "notes".into(),
                reason: "pipe closed".into(),
            }
            .into())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Accepts the first connection, refuses every later one
    struct AcceptOnce {
        attempts: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Connector for AcceptOnce {
        async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn McpSession>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(Arc::new(BrokenPipe));
            }
            Err(McpError::Connect {
                server: config.name.clone(),
                reason: "refused".into(),
            }
            .into())
        }
    }

    #[tokio::test]
    async fn test_mid_call_disconnect_reconnects_then_degrades() {
        let connector = Arc::new(AcceptOnce {
            attempts: AtomicU32::new(0),
        });
        let conn = ServerConnection::new(fast_config("notes"), connector.clone());
        conn.connect().await.unwrap();

        let err = conn.call("lookup", serde_json::json!({"term": "kenning"})).await.unwrap_err();
        assert!(matches!(err, quill_core::Error::Degraded(_)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1 + 3);
        assert!(conn.state().is_degraded());
        assert_eq!(conn.circuit_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_mid_call_disconnect_without_auto_reconnect_waits_for_next_call() {
        let connector = Arc::new(AcceptOnce {
            attempts: AtomicU32::new(0),
        });
        let mut config = fast_config("notes");
        config.auto_reconnect = false;
        let conn = ServerConnection::new(config, connector.clone());
        conn.connect().await.unwrap();

        let err = conn.call("lookup", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, quill_core::Error::Mcp(_)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(conn.state(), ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let connector = Arc::new(FakeConnector::new("notes", 0));
        let conn = ServerConnection::new(fast_config("notes"), connector.clone());
        conn.connect().await.unwrap();

        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(connector.session.closed.load(Ordering::SeqCst));
    }
}

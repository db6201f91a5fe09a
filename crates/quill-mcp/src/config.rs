//! Tool server configuration
//!
//! サーバー設定の読み込み、検証、探索

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use quill_core::{Error, McpConfig, Result, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::McpError;

/// How a server is reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Http,
    Ws,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stdio => f.write_str("stdio"),
            Transport::Http => f.write_str("http"),
            Transport::Ws => f.write_str("ws"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    Bearer,
    ApiKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, alias = "authType")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub secret: String,
}

/// One tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Server name (used for identification)
    pub name: String,

    #[serde(default)]
    pub transport: Transport,

    /// Command to start a stdio server.
    /// Example: "uvx mcp-server-git" or "node /path/to/server.js"
    #[serde(default)]
    pub command: String,

    /// Extra arguments appended to `command`
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to pass to the server
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// URL for http / ws transports
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Whether this server is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true", alias = "autoReconnect")]
    pub auto_reconnect: bool,

    #[serde(default, alias = "retryPolicy")]
    pub retry_policy: RetryPolicy,

    /// Per-call timeout
    #[serde(default = "default_call_timeout", alias = "callTimeoutSecs")]
    pub call_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_call_timeout() -> u64 {
    60
}

impl ToolServerConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: Transport::Stdio,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            endpoint: None,
            credentials: None,
            enabled: true,
            auto_reconnect: true,
            retry_policy: RetryPolicy::default(),
            call_timeout_secs: default_call_timeout(),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    /// Program followed by its arguments; `command` may carry its own arguments
    pub fn argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = self.command.split_whitespace().map(str::to_string).collect();
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn validate(&self) -> std::result::Result<(), McpError> {
        let invalid = |reason: &str| McpError::InvalidConfig {
            server: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("name must be non-empty and use only letters, digits, '-', '_' or '.'"));
        }

        match self.transport {
            Transport::Stdio => {
                if self.command.trim().is_empty() {
                    return Err(invalid("stdio transport needs a command"));
                }
            }
            Transport::Http | Transport::Ws => {
                let schemes: &[&str] = if self.transport == Transport::Http {
                    &["http://", "https://"]
                } else {
                    &["ws://", "wss://"]
                };
                match self.endpoint.as_deref() {
                    Some(url) if schemes.iter().any(|s| url.starts_with(s)) => {}
                    Some(_) => return Err(invalid("endpoint scheme does not match the transport")),
                    None => return Err(invalid("endpoint is required for this transport")),
                }
            }
        }

        if let Some(creds) = &self.credentials {
            if creds.auth_type != AuthType::None && creds.secret.is_empty() {
                return Err(invalid("credentials need a secret"));
            }
        }

        if self.retry_policy.max_attempts == 0 {
            return Err(invalid("retry_policy.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// All server definitions from one config source
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolServersConfig {
    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
}

impl ToolServersConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("Invalid MCP config JSON: {}", e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid MCP config TOML: {}", e)))
    }

    /// Load from a file; `.toml` files are TOML, anything else JSON
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read MCP config {}: {}", path.display(), e)))?;

        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// Load from the `MCP_CONFIG` environment variable (JSON format)
    pub fn from_env() -> Result<Self> {
        let config_json =
            std::env::var("MCP_CONFIG").map_err(|_| Error::Config("MCP_CONFIG not set".to_string()))?;
        Self::from_json_str(&config_json)
    }

    /// Enabled servers that pass validation; duplicates after the first are dropped
    pub fn enabled_servers(&self) -> Vec<ToolServerConfig> {
        let mut seen = HashSet::new();
        let mut servers = Vec::new();
        for server in self.servers.iter().filter(|s| s.enabled) {
            if let Err(e) = server.validate() {
                warn!(server_name = %server.name, error = %e, "Skipping invalid tool server");
                continue;
            }
            if !seen.insert(server.name.clone()) {
                warn!(server_name = %server.name, "Skipping duplicate tool server");
                continue;
            }
            servers.push(server.clone());
        }
        servers
    }
}

/// Resolve the configured tool servers
///
/// Reads `config_path` when set, otherwise the `MCP_CONFIG` variable. No
/// source at all is not an error.
pub fn discover(config: &McpConfig) -> Result<Vec<ToolServerConfig>> {
    discover_with(config, std::env::var("MCP_CONFIG").ok())
}

fn discover_with(config: &McpConfig, env_json: Option<String>) -> Result<Vec<ToolServerConfig>> {
    if !config.enabled {
        info!("MCP integration disabled");
        return Ok(Vec::new());
    }

    let servers = match (&config.config_path, env_json) {
        (Some(path), _) => {
            info!(path = %path, "Loading MCP configuration from file");
            ToolServersConfig::from_file(path)?
        }
        (None, Some(json)) => ToolServersConfig::from_json_str(&json)?,
        (None, None) => {
            info!("No MCP configuration specified");
            return Ok(Vec::new());
        }
    };

    Ok(servers.enabled_servers())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ToolServersConfig::new();
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "servers": [
                {
                    "name": "git",
                    "command": "uvx mcp-server-git",
                    "args": ["--repository", "."],
                    "env": {"GIT_DIR": ".git"},
                    "autoReconnect": false,
                    "retryPolicy": {"maxAttempts": 5, "backoffMs": 250}
                }
            ]
        }"#;

        let config = ToolServersConfig::from_json_str(json).unwrap();
        let git = &config.servers[0];
        assert_eq!(git.transport, Transport::Stdio);
        assert_eq!(git.argv(), vec!["uvx", "mcp-server-git", "--repository", "."]);
        assert!(!git.auto_reconnect);
        assert_eq!(git.retry_policy.max_attempts, 5);
        assert_eq!(git.retry_policy.backoff_ms, 250);
        assert!(git.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
[[servers]]
name = "search"
transport = "http"
endpoint = "https://tools.example.com/mcp"
credentials = { auth_type = "bearer", secret = "abc" }
"#;
        let config = ToolServersConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.servers[0].transport, Transport::Http);
        assert!(config.servers[0].validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut server = ToolServerConfig::stdio("git", "");
        assert!(server.validate().is_err());

        server.command = "git-mcp".into();
        server.name = "has space".into();
        assert!(server.validate().is_err());

        let mut web = ToolServerConfig::stdio("web", "unused");
        web.transport = Transport::Ws;
        assert!(web.validate().is_err());
        web.endpoint = Some("https://example.com".into());
        assert!(web.validate().is_err());
        web.endpoint = Some("wss://example.com".into());
        assert!(web.validate().is_ok());

        web.credentials = Some(Credentials {
            auth_type: AuthType::ApiKey,
            secret: String::new(),
        });
        assert!(web.validate().is_err());
    }

    #[test]
    fn test_discover_filters_disabled_invalid_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        std::fs::write(
            &path,
            r#"{"servers": [
                {"name": "git", "command": "git-mcp"},
                {"name": "off", "command": "off-mcp", "enabled": false},
                {"name": "broken", "transport": "http"},
                {"name": "git", "command": "other"}
            ]}"#,
        )
        .unwrap();

        let config = McpConfig {
            config_path: Some(path.to_string_lossy().into_owned()),
            enabled: true,
        };
        let servers = discover_with(&config, None).unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].command, "git-mcp");
    }

    #[test]
    fn test_discover_from_env_and_disabled() {
        let config = McpConfig {
            config_path: None,
            enabled: true,
        };
        let servers = discover_with(
            &config,
            Some(r#"{"servers": [{"name": "notes", "command": "notes-mcp"}]}"#.into()),
        )
        .unwrap();
        assert_eq!(servers[0].name, "notes");

        assert!(discover_with(&config, None).unwrap().is_empty());

        let disabled = McpConfig {
            config_path: None,
            enabled: false,
        };
        assert!(
            discover_with(&disabled, Some(r#"{"servers": [{"name": "a", "command": "b"}]}"#.into()))
                .unwrap()
                .is_empty()
        );
    }
}

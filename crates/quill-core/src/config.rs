//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数
//! 2. quill.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// LLM Provider type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic messages API
    #[default]
    Claude,
    /// OpenAI-compatible chat completions API
    OpenAi,
}

impl LlmProvider {
    /// Parse a provider name, accepting the aliases used by compatible vendors
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "openai" | "glm" | "zai" | "minimax" | "deepseek" => LlmProvider::OpenAi,
            _ => LlmProvider::Claude,
        }
    }
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key
    #[serde(default, skip_serializing)]
    pub api_key: String,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// API provider
    #[serde(default)]
    pub provider: LlmProvider,

    /// Base URL (optional, for custom endpoints)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Default completion budget
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            provider: LlmProvider::Claude,
            base_url: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Where the context store lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory holding one subdirectory per workspace
    #[serde(default = "default_workspace_root")]
    pub root: String,

    /// Workspace identifier
    #[serde(default = "default_workspace_id")]
    pub id: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            id: default_workspace_id(),
        }
    }
}

impl WorkspaceConfig {
    /// Directory the context store is rooted at
    pub fn dir(&self) -> PathBuf {
        Path::new(&self.root).join(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Content longer than this many characters is never inlined into a prompt
    #[serde(default = "default_externalize_threshold")]
    pub externalize_threshold: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            externalize_threshold: default_externalize_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Path to MCP configuration file (JSON or TOML)
    #[serde(default)]
    pub config_path: Option<String>,

    /// Whether MCP integration is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directories scanned for skill packages at startup
    #[serde(default = "default_skill_dirs")]
    pub dirs: Vec<String>,

    /// Command prefix wrapping every script invocation (e.g. `["bwrap", "--unshare-all", "--"]`)
    #[serde(default)]
    pub sandbox_launcher: Vec<String>,

    /// Script timeout when the package does not set one
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,

    /// Maximum bytes of script stdout kept
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dirs: default_skill_dirs(),
            sandbox_launcher: Vec::new(),
            script_timeout_secs: default_script_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Timeout for a single task execution
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Timeout for a single tool invocation
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Maximum sub-agents running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum tool call rounds per directly executed task
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    /// Owner id used for memory lookups
    #[serde(default = "default_owner")]
    pub owner: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            max_tool_rounds: default_max_tool_rounds(),
            owner: default_owner(),
        }
    }
}

/// Main configuration for quill
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub mcp: McpConfig,

    #[serde(default)]
    pub skills: SkillsConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_workspace_root() -> String {
    "data/workspace".to_string()
}

fn default_workspace_id() -> String {
    "default".to_string()
}

fn default_externalize_threshold() -> usize {
    10_000
}

fn default_db_path() -> String {
    "data/quill.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_skill_dirs() -> Vec<String> {
    vec!["skills".to_string()]
}

fn default_script_timeout_secs() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_tool_rounds() -> usize {
    4
}

fn default_owner() -> String {
    "default".to_string()
}

impl Config {
    /// 文字列中の `${VAR_NAME}` を環境変数の値に置換する
    ///
    /// 環境変数が存在しない場合は空文字列になります。
    pub fn expand_env_vars(value: &str) -> String {
        let mut result = String::with_capacity(value.len());
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{' を消費

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// TOML 文字列から設定を読み込む（環境変数の上書きは行わない）
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// TOML 設定ファイルから設定を読み込む
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut cfg = Self::from_toml_str(&content)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// 環境変数のみから設定を構築する
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// `./quill.toml` があればそれを使い、なければ環境変数のみ。
    pub fn load() -> Result<Self> {
        if Path::new("quill.toml").exists() {
            return Self::from_toml_file("quill.toml");
        }
        Self::from_env()
    }

    /// Reject values that would make the runtime misbehave
    pub fn validate(&self) -> Result<()> {
        if self.context.externalize_threshold == 0 {
            return Err(Error::Config(
                "context.externalize_threshold must be greater than zero".into(),
            ));
        }
        if self.orchestrator.max_concurrency == 0 {
            return Err(Error::Config(
                "orchestrator.max_concurrency must be greater than zero".into(),
            ));
        }
        if self.workspace.id.is_empty() || self.workspace.id.contains(['/', '\\']) {
            return Err(Error::Config(format!(
                "invalid workspace id: {:?}",
                self.workspace.id
            )));
        }
        Ok(())
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) {
        if let Ok(api_key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = api_key;
        }
        if let Some(model) = non_empty_env("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(provider) = non_empty_env("LLM_PROVIDER") {
            self.llm.provider = LlmProvider::parse(&provider);
        }
        if let Some(base_url) = non_empty_env("LLM_BASE_URL") {
            self.llm.base_url = Some(base_url);
        }

        if let Some(root) = non_empty_env("QUILL_WORKSPACE_ROOT") {
            self.workspace.root = root;
        }
        if let Some(id) = non_empty_env("QUILL_WORKSPACE_ID") {
            self.workspace.id = id;
        }
        if let Some(threshold) = non_empty_env("QUILL_EXTERNALIZE_THRESHOLD") {
            if let Ok(v) = threshold.parse() {
                self.context.externalize_threshold = v;
            }
        }

        if let Some(path) = non_empty_env("QUILL_DB_PATH") {
            self.memory.db_path = path;
        }

        if let Some(path) = non_empty_env("MCP_CONFIG_PATH") {
            self.mcp.config_path = Some(path);
        }
        if let Ok(enabled) = std::env::var("MCP_ENABLED") {
            self.mcp.enabled = enabled != "false" && enabled != "0";
        }

        if let Some(dirs) = non_empty_env("QUILL_SKILL_DIRS") {
            self.skills.dirs = dirs.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

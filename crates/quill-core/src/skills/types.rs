//! Skill package types

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Where a skill is active
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillScope {
    /// Visible everywhere
    Global,
    /// Visible only inside one workspace
    Workspace(String),
}

impl SkillScope {
    /// `global` or `workspace:<id>`
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("global") {
            return Some(SkillScope::Global);
        }
        value
            .strip_prefix("workspace:")
            .filter(|id| !id.is_empty())
            .map(|id| SkillScope::Workspace(id.to_string()))
    }
}

impl fmt::Display for SkillScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillScope::Global => f.write_str("global"),
            SkillScope::Workspace(id) => write!(f, "workspace:{}", id),
        }
    }
}

/// A tool backed by a packaged script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Path of the script, relative to the package root (under `scripts/`)
    pub script: String,
    #[serde(default)]
    pub input_schema: Option<JsonValue>,
}

impl SkillToolSpec {
    pub fn schema(&self) -> JsonValue {
        self.input_schema.clone().unwrap_or_else(|| {
            serde_json::json!({
                "type": "object",
                "properties": {}
            })
        })
    }
}

/// Limits a package asks for; the loader's defaults fill the gaps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
}

/// Parsed `SKILL.md`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillManifest {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_provider")]
    pub provider: String,

    /// Defaults to the provider
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub description: String,

    /// Instructions injected into prompts while the skill is active
    #[serde(default)]
    pub instructions: String,

    /// Files the package must ship, relative to its root
    #[serde(default)]
    pub resources: Vec<String>,

    #[serde(default)]
    pub tools: Vec<SkillToolSpec>,

    #[serde(default)]
    pub sandbox: SandboxPolicy,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_provider() -> String {
    "custom".to_string()
}

impl SkillManifest {
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.provider)
    }

    /// `namespace/name`; at most one package per qualified name is active in a scope
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace(), self.name)
    }
}

/// A loaded, validated skill package
#[derive(Debug, Clone, Serialize)]
pub struct SkillPackage {
    /// `namespace/name@version`
    pub id: String,
    pub manifest: SkillManifest,
    /// Directory holding the package files
    pub root: PathBuf,
    /// Archive or directory the package was loaded from
    pub source: PathBuf,
    /// Archive entries that were refused during extraction
    #[serde(skip)]
    pub rejected_entries: Vec<String>,
}

impl SkillPackage {
    pub fn new(manifest: SkillManifest, root: PathBuf, source: PathBuf) -> Self {
        Self {
            id: format!("{}@{}", manifest.qualified_name(), manifest.version),
            manifest,
            root,
            source,
            rejected_entries: Vec::new(),
        }
    }

    pub fn qualified_name(&self) -> String {
        self.manifest.qualified_name()
    }

    pub fn resource_path(&self, resource: &str) -> PathBuf {
        self.root.join(resource)
    }

    pub fn script_path(&self, tool: &SkillToolSpec) -> PathBuf {
        self.root.join(&tool.script)
    }
}

/// Outcome of static package checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

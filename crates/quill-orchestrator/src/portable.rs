//! Portable configuration
//!
//! ツールサーバーとスキルの設定をエクスポート／インポートします。
//! An import is validated as a whole before anything is applied; conflicts
//! with what is already configured are settled by an [`ImportPolicy`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use quill_core::skills::SkillScope;
use quill_core::{Error, Result, ToolManager};
use quill_mcp::ToolServerConfig;

use crate::runtime::RuntimeRegistry;

/// Format version written by `export`; imports accept the same major version
pub const EXPORT_VERSION: &str = "1.0";

/// A loaded skill and where it is active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableSkill {
    pub id: String,
    /// Directory or archive the package is loaded from
    pub source: PathBuf,
    #[serde(default)]
    pub scopes: Vec<SkillScope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableConfig {
    pub version: String,
    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
    #[serde(default)]
    pub skills: Vec<PortableSkill>,
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
}

impl PortableConfig {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidInput(format!("unreadable configuration: {}", e)))
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    /// Check the whole document; nothing is applied when this fails
    pub async fn validate(&self) -> Result<()> {
        let major = self.version.split('.').next().unwrap_or("");
        let expected = EXPORT_VERSION.split('.').next().unwrap_or("");
        if major != expected {
            return Err(Error::InvalidInput(format!(
                "unsupported configuration version {} (expected {}.x)",
                self.version, expected
            )));
        }

        let mut names = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !names.insert(server.name.as_str()) {
                return Err(Error::InvalidInput(format!("tool server {} is listed twice", server.name)));
            }
        }

        let mut ids = HashSet::new();
        for skill in &self.skills {
            if !ids.insert(skill.id.as_str()) {
                return Err(Error::InvalidInput(format!("skill {} is listed twice", skill.id)));
            }
            if !tokio::fs::try_exists(&skill.source).await.unwrap_or(false) {
                return Err(Error::InvalidInput(format!(
                    "skill {} source {} does not exist",
                    skill.id,
                    skill.source.display()
                )));
            }
        }
        Ok(())
    }
}

/// How an import treats entries that already exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportPolicy {
    /// Replace the existing entry
    Overwrite,
    /// Keep existing values and fill in what the import adds
    #[default]
    Merge,
    /// Leave the existing entry alone
    Skip,
}

impl ImportPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "overwrite" => Some(Self::Overwrite),
            "merge" => Some(Self::Merge),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Merge => "merge",
            Self::Skip => "skip",
        }
    }
}

/// What an import did, by entry name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub added: Vec<String>,
    pub replaced: Vec<String>,
    pub merged: Vec<String>,
    pub skipped: Vec<String>,
    /// Entries applied but not usable right now, with the reason
    pub failed: Vec<String>,
}

/// Existing values win; the import fills gaps and adds env keys and args
fn merge_server(existing: &ToolServerConfig, incoming: &ToolServerConfig) -> ToolServerConfig {
    let mut merged = existing.clone();
    if merged.endpoint.is_none() {
        merged.endpoint = incoming.endpoint.clone();
    }
    if merged.credentials.is_none() {
        merged.credentials = incoming.credentials.clone();
    }
    for (key, value) in &incoming.env {
        merged.env.entry(key.clone()).or_insert_with(|| value.clone());
    }
    for arg in &incoming.args {
        if !merged.args.contains(arg) {
            merged.args.push(arg.clone());
        }
    }
    merged
}

/// Snapshot of the configured servers and loaded skills
pub async fn export(runtime: &RuntimeRegistry) -> PortableConfig {
    let servers = runtime.mcp().lock().await.configs();
    let skills = {
        let loader = runtime.skills().lock().await;
        loader
            .packages()
            .into_iter()
            .map(|p| PortableSkill {
                id: p.id.clone(),
                source: p.source.clone(),
                scopes: loader.active_scopes(&p.id),
            })
            .collect()
    };
    PortableConfig {
        version: EXPORT_VERSION.to_string(),
        servers,
        skills,
        exported_at: Some(Utc::now()),
    }
}

/// Validate `config`, then apply it under `policy`
pub async fn import(runtime: &RuntimeRegistry, config: &PortableConfig, policy: ImportPolicy) -> Result<ImportReport> {
    config.validate().await?;
    let mut report = ImportReport::default();
    import_servers(runtime, &config.servers, policy, &mut report).await;
    import_skills(runtime, &config.skills, policy, &mut report).await;
    info!(
        policy = policy.as_str(),
        added = report.added.len(),
        replaced = report.replaced.len(),
        merged = report.merged.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "Configuration imported"
    );
    Ok(report)
}

async fn import_servers(
    runtime: &RuntimeRegistry,
    servers: &[ToolServerConfig],
    policy: ImportPolicy,
    report: &mut ImportReport,
) {
    let mut registry = runtime.mcp().lock().await;
    for incoming in servers {
        let name = incoming.name.clone();
        let existing = registry.connection(&name).map(|c| c.config().clone());

        let target = match (&existing, policy) {
            (None, _) => {
                report.added.push(name.clone());
                incoming.clone()
            }
            (Some(_), ImportPolicy::Skip) => {
                report.skipped.push(name);
                continue;
            }
            (Some(_), ImportPolicy::Overwrite) => {
                report.replaced.push(name.clone());
                incoming.clone()
            }
            (Some(current), ImportPolicy::Merge) => {
                report.merged.push(name.clone());
                let merged = merge_server(current, incoming);
                if &merged == current {
                    continue;
                }
                merged
            }
        };

        if existing.is_some() {
            registry.remove_server(&name, &mut *runtime.tools().write().await).await;
        }

        // connect without holding the tool manager, then publish the tools
        let mut staged = ToolManager::new();
        if let Err(e) = registry.add_server(target, &mut staged).await {
            warn!(server_name = %name, error = %e, "Imported server is not reachable");
            report.failed.push(format!("{}: {}", name, e));
        }
        let mut tools = runtime.tools().write().await;
        for tool_name in staged.tool_names() {
            if let Some(tool) = staged.get(tool_name) {
                tools.register(tool);
            }
        }
    }
}

async fn import_skills(runtime: &RuntimeRegistry, skills: &[PortableSkill], policy: ImportPolicy, report: &mut ImportReport) {
    let mut loader = runtime.skills().lock().await;
    for incoming in skills {
        let exists = loader.get(&incoming.id).is_some();

        let id = match (exists, policy) {
            (true, ImportPolicy::Skip) => {
                report.skipped.push(incoming.id.clone());
                continue;
            }
            (true, ImportPolicy::Merge) => {
                report.merged.push(incoming.id.clone());
                incoming.id.clone()
            }
            (true, ImportPolicy::Overwrite) | (false, _) => {
                if exists {
                    let mut tools = runtime.tools().write().await;
                    if let Err(e) = loader.unload(&incoming.id, &mut tools) {
                        report.failed.push(format!("{}: {}", incoming.id, e));
                        continue;
                    }
                }
                let id = match loader.load(&incoming.source).await {
                    Ok(id) => id,
                    Err(e) => {
                        report.failed.push(format!("{}: {}", incoming.id, e));
                        continue;
                    }
                };
                if id != incoming.id {
                    warn!(expected = %incoming.id, loaded = %id, "Imported skill loaded under a different id");
                }
                if exists {
                    report.replaced.push(id.clone());
                } else {
                    report.added.push(id.clone());
                }
                id
            }
        };

        let active = loader.active_scopes(&id);
        let mut tools = runtime.tools().write().await;
        for scope in incoming.scopes.iter().filter(|s| !active.contains(*s)) {
            if let Err(e) = loader.activate(&id, scope.clone(), &mut tools) {
                warn!(skill = %id, scope = %scope, error = %e, "Imported skill could not be activated");
                report.failed.push(format!("{} in {}: {}", id, scope, e));
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use quill_core::{CapabilityLoader, ContextStore, ProcessSandbox, SubAgentManager, ToolResult};
    use quill_mcp::{Connector, McpRegistry, McpSession, ToolDescriptor};
    use serde_json::{Value as JsonValue, json};
    use std::sync::Arc;

    use crate::executor::tests::Scripted;

    /// Serves one `<server>_echo` tool per server
    pub(crate) struct EchoConnector;

    struct EchoSession(String);

    #[async_trait]
    impl McpSession for EchoSession {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
            Ok(vec![ToolDescriptor {
                server: self.0.clone(),
                name: format!("{}_echo", self.0),
                description: "Echo".into(),
                input_schema: json!({"type": "object"}),
                output_schema: None,
            }])
        }
        async fn call_tool(&self, _name: &str, args: JsonValue) -> Result<ToolResult> {
            Ok(ToolResult::success(args.to_string()))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Connector for EchoConnector {
        async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn McpSession>> {
            Ok(Arc::new(EchoSession(config.name.clone())))
        }
    }

    fn runtime(dir: &Path) -> RuntimeRegistry {
        let store = ContextStore::open(dir.join("ws"), 1_000).unwrap();
        let worker = Arc::new(quill_core::LlmSubAgent::new(Scripted::new(&[])));
        RuntimeRegistry::new(
            ToolManager::new(),
            McpRegistry::new(Arc::new(EchoConnector)),
            CapabilityLoader::new(Arc::new(ProcessSandbox::default()), dir.join("extract")),
            Arc::new(SubAgentManager::new(store, worker, 1)),
        )
    }

    fn server(name: &str, env: &[(&str, &str)]) -> ToolServerConfig {
        let mut config = ToolServerConfig::stdio(name, "fake-server");
        for (k, v) in env {
            config.env.insert(k.to_string(), v.to_string());
        }
        config
    }

    fn document(servers: Vec<ToolServerConfig>) -> PortableConfig {
        PortableConfig {
            version: EXPORT_VERSION.into(),
            servers,
            skills: Vec::new(),
            exported_at: None,
        }
    }

    fn write_skill(dir: &Path) -> PathBuf {
        let root = dir.join("cite");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("SKILL.md"),
            "---\nname: cite\nprovider: acme\ndescription: Citations\n---\nAlways cite sources.\n",
        )
        .unwrap();
        root
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(ImportPolicy::parse("Overwrite"), Some(ImportPolicy::Overwrite));
        assert_eq!(ImportPolicy::parse("skip"), Some(ImportPolicy::Skip));
        assert_eq!(ImportPolicy::parse("replace"), None);
    }

    #[test]
    fn test_merge_keeps_existing_values() {
        let mut existing = server("a", &[("KEY", "old")]);
        existing.args = vec!["--x".into()];
        let mut incoming = server("a", &[("KEY", "new"), ("EXTRA", "1")]);
        incoming.command = "other".into();
        incoming.args = vec!["--x".into(), "--y".into()];

        let merged = merge_server(&existing, &incoming);
        assert_eq!(merged.command, "fake-server");
        assert_eq!(merged.env["KEY"], "old");
        assert_eq!(merged.env["EXTRA"], "1");
        assert_eq!(merged.args, vec!["--x", "--y"]);
    }

    #[tokio::test]
    async fn test_invalid_document_applies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());
        let config = document(vec![server("good", &[]), server("bad name", &[])]);

        assert!(import(&runtime, &config, ImportPolicy::Overwrite).await.is_err());
        assert_eq!(runtime.mcp().lock().await.server_count(), 0);

        let mut future = document(vec![]);
        future.version = "2.0".into();
        assert!(future.validate().await.is_err());

        let duplicated = document(vec![server("a", &[]), server("a", &[])]);
        assert!(duplicated.validate().await.is_err());
    }

    #[tokio::test]
    async fn test_import_policies_for_servers() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path());

        let first = import(&runtime, &document(vec![server("a", &[("KEY", "1")])]), ImportPolicy::Merge)
            .await
            .unwrap();
        assert_eq!(first.added, vec!["a"]);
        assert!(runtime.tools().read().await.contains("a_echo"));

        let incoming = document(vec![server("a", &[("KEY", "2")]), server("b", &[])]);

        let skipped = import(&runtime, &incoming, ImportPolicy::Skip).await.unwrap();
        assert_eq!(skipped.skipped, vec!["a"]);
        assert_eq!(skipped.added, vec!["b"]);

        let merged = import(&runtime, &incoming, ImportPolicy::Merge).await.unwrap();
        assert_eq!(merged.merged, vec!["a", "b"]);
        let config = runtime.mcp().lock().await.connection("a").unwrap().config().clone();
        assert_eq!(config.env["KEY"], "1");

        let replaced = import(&runtime, &incoming, ImportPolicy::Overwrite).await.unwrap();
        assert_eq!(replaced.replaced, vec!["a", "b"]);
        let config = runtime.mcp().lock().await.connection("a").unwrap().config().clone();
        assert_eq!(config.env["KEY"], "2");
        assert!(runtime.tools().read().await.contains("a_echo"));
    }

    #[tokio::test]
    async fn test_export_then_import_restores_skills() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_skill(dir.path());

        let original = runtime(dir.path());
        {
            let mut loader = original.skills().lock().await;
            let id = loader.load(&source).await.unwrap();
            let mut tools = original.tools().write().await;
            loader.activate(&id, SkillScope::Global, &mut tools).unwrap();
        }
        let exported = export(&original).await;
        assert_eq!(exported.skills.len(), 1);
        assert_eq!(exported.skills[0].scopes, vec![SkillScope::Global]);

        let restored = runtime(dir.path());
        let document = PortableConfig::from_json(&exported.to_json().unwrap()).unwrap();
        let report = import(&restored, &document, ImportPolicy::Merge).await.unwrap();
        assert_eq!(report.added, vec!["acme/cite@1.0.0"]);
        assert!(
            restored
                .skills()
                .lock()
                .await
                .effective_instructions(&SkillScope::Global)
                .contains("Always cite sources.")
        );

        let again = import(&restored, &document, ImportPolicy::Skip).await.unwrap();
        assert_eq!(again.skipped, vec!["acme/cite@1.0.0"]);
    }
}

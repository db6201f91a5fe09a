//! Capability loader
//!
//! Loads skill packages from directories or zip archives, validates them
//! without running anything, and flips them active per scope. Activation
//! registers the package's script tools with the [`ToolManager`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::fs;
use tracing::{debug, info, warn};

use super::manifest::{MANIFEST_FILE, parse_manifest};
use super::{
    Sandbox, ScriptRequest, SkillPackage, SkillScope, SkillToolSpec, ValidationResult,
};
use crate::config::SkillsConfig;
use crate::tool::{InternalTool, Tool, ToolManager, ToolOrigin, ToolResult};
use crate::{Error, Result};

const SCRIPT_EXTENSIONS: &[&str] = &["sh", "bash", "py", "js", "exe"];

/// Registry of loaded skill packages and their activation state
pub struct CapabilityLoader {
    sandbox: Arc<dyn Sandbox>,
    /// Where archives are unpacked
    extract_root: PathBuf,
    default_timeout: Duration,
    max_output_bytes: usize,
    packages: HashMap<String, SkillPackage>,
    /// scope -> qualified name -> package id
    active: HashMap<SkillScope, BTreeMap<String, String>>,
}

impl CapabilityLoader {
    pub fn new(sandbox: Arc<dyn Sandbox>, extract_root: impl Into<PathBuf>) -> Self {
        Self {
            sandbox,
            extract_root: extract_root.into(),
            default_timeout: Duration::from_secs(30),
            max_output_bytes: 64 * 1024,
            packages: HashMap::new(),
            active: HashMap::new(),
        }
    }

    pub fn from_config(sandbox: Arc<dyn Sandbox>, extract_root: impl Into<PathBuf>, config: &SkillsConfig) -> Self {
        let mut loader = Self::new(sandbox, extract_root);
        loader.default_timeout = Duration::from_secs(config.script_timeout_secs);
        loader.max_output_bytes = config.max_output_bytes;
        loader
    }

    /// Load, validate and register a package from a directory or `.zip` archive
    ///
    /// Returns the package id. A package with validation errors is refused.
    pub async fn load(&mut self, path: impl AsRef<Path>) -> Result<String> {
        let source = path.as_ref().to_path_buf();
        let is_archive = source
            .extension()
            .map(|e| e.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);

        let (root, rejected) = if is_archive {
            self.unpack(&source).await?
        } else {
            (source.clone(), Vec::new())
        };

        let content = fs::read_to_string(root.join(MANIFEST_FILE))
            .await
            .map_err(|e| Error::SkillValidation(format!("{} not readable in {}: {}", MANIFEST_FILE, source.display(), e)))?;
        let manifest = parse_manifest(&content)?;

        let mut package = SkillPackage::new(manifest, root, source.clone());
        package.rejected_entries = rejected;

        let report = self.validate(&package);
        for warning in &report.warnings {
            warn!(skill = %package.id, warning = %warning, "Skill validation warning");
        }
        if !report.is_valid() {
            return Err(Error::SkillValidation(format!(
                "{}: {}",
                package.id,
                report.errors.join("; ")
            )));
        }

        let id = package.id.clone();
        if self.packages.contains_key(&id) {
            if self.is_active_anywhere(&id) {
                return Err(Error::SkillConflict(format!("{} is loaded and active", id)));
            }
            debug!(skill = %id, "Replacing inactive skill package");
        }
        info!(
            skill = %id,
            source = %source.display(),
            tools = package.manifest.tools.len(),
            "Loaded skill package"
        );
        self.packages.insert(id.clone(), package);
        Ok(id)
    }

    /// Load every package (subdirectory with `SKILL.md`, or `.zip`) found in `dirs`
    ///
    /// Broken packages are logged and skipped.
    pub async fn load_dirs(&mut self, dirs: &[PathBuf]) -> Result<Vec<String>> {
        let mut loaded = Vec::new();
        for dir in dirs {
            if !dir.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(dir).await?;
            let mut candidates = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let is_zip = path.extension().map(|e| e == "zip").unwrap_or(false);
                if is_zip || path.join(MANIFEST_FILE).is_file() {
                    candidates.push(path);
                }
            }
            candidates.sort();

            for path in candidates {
                match self.load(&path).await {
                    Ok(id) => loaded.push(id),
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to load skill package"),
                }
            }
        }
        Ok(loaded)
    }

    async fn unpack(&self, archive: &Path) -> Result<(PathBuf, Vec<String>)> {
        let stem = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "skill".to_string());
        let dest = self
            .extract_root
            .join(format!("{}-{}", stem, uuid::Uuid::now_v7().simple()));

        let archive = archive.to_path_buf();
        let target = dest.clone();
        let rejected = tokio::task::spawn_blocking(move || extract_archive(&archive, &target))
            .await
            .map_err(|e| Error::Other(format!("archive extraction task failed: {}", e)))??;

        Ok((package_root(&dest), rejected))
    }

    /// Static checks; never executes anything from the package
    pub fn validate(&self, package: &SkillPackage) -> ValidationResult {
        let mut report = ValidationResult::default();
        let manifest = &package.manifest;

        if !is_identifier(&manifest.name) {
            report.error(format!(
                "name '{}' must contain only letters, digits, '-' and '_'",
                manifest.name
            ));
        }
        if !is_identifier(manifest.namespace()) {
            report.error(format!("namespace '{}' is not a valid identifier", manifest.namespace()));
        }
        if !is_version(&manifest.version) {
            report.error(format!("version '{}' is not MAJOR.MINOR[.PATCH]", manifest.version));
        }
        if manifest.instructions.trim().is_empty() {
            report.error("instructions are empty");
        }
        if manifest.description.trim().is_empty() {
            report.warn("no description");
        }

        for entry in &package.rejected_entries {
            report.error(format!("archive entry '{}' escapes the package root", entry));
        }

        for resource in &manifest.resources {
            match safe_relative(resource) {
                Some(_) if package.resource_path(resource).exists() => {}
                Some(_) => report.error(format!("required resource '{}' is missing", resource)),
                None => report.error(format!("resource path '{}' escapes the package root", resource)),
            }
        }

        let mut tool_names = BTreeSet::new();
        for tool in &manifest.tools {
            if !is_identifier(&tool.name) {
                report.error(format!("tool name '{}' is not a valid identifier", tool.name));
            }
            if !tool_names.insert(tool.name.as_str()) {
                report.error(format!("tool '{}' is declared twice", tool.name));
            }
            match safe_relative(&tool.script) {
                Some(rel) if !rel.starts_with("scripts") => report.error(format!(
                    "script '{}' of tool '{}' must live under scripts/",
                    tool.script, tool.name
                )),
                Some(rel) if !package.root.join(&rel).is_file() => report.error(format!(
                    "script '{}' of tool '{}' is missing",
                    tool.script, tool.name
                )),
                Some(_) => {}
                None => report.error(format!("script path '{}' escapes the package root", tool.script)),
            }
            if tool.input_schema.is_none() {
                report.warn(format!("tool '{}' declares no input schema", tool.name));
            }
        }

        for stray in stray_executables(&package.root) {
            report.warn(format!("executable file outside scripts/: {}", stray));
        }

        report
    }

    /// Make a package active in `scope`
    ///
    /// Registers the package's tools on first activation. Fails with
    /// `SkillConflict` when another package with the same qualified name is
    /// already active in the scope. Activating twice is a no-op.
    pub fn activate(&mut self, skill_id: &str, scope: SkillScope, tools: &mut ToolManager) -> Result<Vec<String>> {
        let package = self
            .packages
            .get(skill_id)
            .ok_or_else(|| Error::NotFound(format!("skill {}", skill_id)))?;
        let qualified = package.qualified_name();

        if let Some(current) = self.active.get(&scope).and_then(|m| m.get(&qualified)) {
            if current == skill_id {
                return Ok(Vec::new());
            }
            return Err(Error::SkillConflict(format!(
                "{} is already active in scope {} as {}",
                qualified, scope, current
            )));
        }

        let mut registered = Vec::new();
        if !self.is_active_anywhere(skill_id) {
            for spec in &package.manifest.tools {
                let tool = SkillScriptTool {
                    spec: spec.clone(),
                    script: package.script_path(spec),
                    sandbox: self.sandbox.clone(),
                    timeout: package
                        .manifest
                        .sandbox
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(self.default_timeout),
                    max_output_bytes: package
                        .manifest
                        .sandbox
                        .max_output_bytes
                        .unwrap_or(self.max_output_bytes),
                };
                tools.register(InternalTool::skill(skill_id, Arc::new(tool)));
                registered.push(spec.name.clone());
            }
        }

        self.active
            .entry(scope.clone())
            .or_default()
            .insert(qualified, skill_id.to_string());
        info!(skill = %skill_id, scope = %scope, tools = registered.len(), "Skill activated");
        Ok(registered)
    }

    /// Deactivate a package in `scope`; its tools go away once no scope uses it
    pub fn deactivate(&mut self, skill_id: &str, scope: &SkillScope, tools: &mut ToolManager) -> Result<bool> {
        let package = self
            .packages
            .get(skill_id)
            .ok_or_else(|| Error::NotFound(format!("skill {}", skill_id)))?;
        let qualified = package.qualified_name();

        let removed = match self.active.get_mut(scope) {
            Some(map) if map.get(&qualified).map(|id| id == skill_id).unwrap_or(false) => {
                map.remove(&qualified);
                true
            }
            _ => false,
        };

        if removed && !self.is_active_anywhere(skill_id) {
            let dropped = tools.unregister_origin(&ToolOrigin::Skill {
                skill: skill_id.to_string(),
            });
            debug!(skill = %skill_id, tools = ?dropped, "Skill tools unregistered");
        }
        if removed {
            info!(skill = %skill_id, scope = %scope, "Skill deactivated");
        }
        Ok(removed)
    }

    fn is_active_anywhere(&self, skill_id: &str) -> bool {
        self.active
            .values()
            .any(|m| m.values().any(|id| id == skill_id))
    }

    fn instructions_for(&self, scope: &SkillScope) -> Vec<String> {
        let Some(active) = self.active.get(scope) else {
            return Vec::new();
        };
        active
            .values()
            .filter_map(|id| self.packages.get(id))
            .filter(|p| !p.manifest.instructions.is_empty())
            .map(|p| format!("# {}\n{}", p.manifest.name, p.manifest.instructions))
            .collect()
    }

    /// Instructions of every skill active globally plus those active in `scope`
    pub fn effective_instructions(&self, scope: &SkillScope) -> String {
        let mut sections = self.instructions_for(&SkillScope::Global);
        if *scope != SkillScope::Global {
            sections.extend(self.instructions_for(scope));
        }
        sections.join("\n\n")
    }

    pub fn get(&self, skill_id: &str) -> Option<&SkillPackage> {
        self.packages.get(skill_id)
    }

    /// Loaded packages, sorted by id
    pub fn packages(&self) -> Vec<&SkillPackage> {
        let mut all: Vec<_> = self.packages.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Scopes in which a package is active
    pub fn active_scopes(&self, skill_id: &str) -> Vec<SkillScope> {
        let mut scopes: Vec<SkillScope> = self
            .active
            .iter()
            .filter(|(_, m)| m.values().any(|id| id == skill_id))
            .map(|(scope, _)| scope.clone())
            .collect();
        scopes.sort();
        scopes
    }

    /// Deactivate everywhere and forget a package
    pub fn unload(&mut self, skill_id: &str, tools: &mut ToolManager) -> Result<()> {
        for scope in self.active_scopes(skill_id) {
            self.deactivate(skill_id, &scope, tools)?;
        }
        self.packages
            .remove(skill_id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("skill {}", skill_id)))
    }
}

/// Letters, digits, `-` and `_`
fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// `MAJOR.MINOR[.PATCH]` with an optional `-pre` or `+build` suffix
fn is_version(value: &str) -> bool {
    let (core, suffix) = match value.find(['-', '+']) {
        Some(i) => (&value[..i], Some(&value[i + 1..])),
        None => (value, None),
    };
    let parts: Vec<&str> = core.split('.').collect();
    (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        && suffix.map(|s| !s.is_empty()).unwrap_or(true)
}

/// Relative path with no `..`, root or prefix components
fn safe_relative(raw: &str) -> Option<PathBuf> {
    let path = Path::new(raw);
    let clean = path
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir));
    (clean && !raw.is_empty()).then(|| path.to_path_buf())
}

fn stray_executables(root: &Path) -> Vec<String> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&root.to_string_lossy()));
    let Ok(entries) = glob::glob(&pattern) else {
        return Vec::new();
    };
    let mut stray: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| SCRIPT_EXTENSIONS.contains(&e))
                .unwrap_or(false)
        })
        .filter_map(|p| p.strip_prefix(root).ok().map(|r| r.to_path_buf()))
        .filter(|r| !r.starts_with("scripts"))
        .map(|r| r.display().to_string())
        .collect();
    stray.sort();
    stray
}

/// Unpack `archive` into `dest`, returning entries refused for path traversal
fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::SkillValidation(format!("{} is not a readable archive: {}", archive.display(), e)))?;
    std::fs::create_dir_all(dest)?;

    let mut rejected = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::SkillValidation(format!("corrupt archive entry {}: {}", i, e)))?;
        let name = entry.name().to_string();
        let relative = match entry.enclosed_name().map(|p| p.to_path_buf()) {
            Some(p) if !name.contains("..") => p,
            _ => {
                warn!(entry = %name, "Refusing archive entry outside the package");
                rejected.push(name);
                continue;
            }
        };

        let out = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::File::create(&out)?;
            std::io::copy(&mut entry, &mut file)?;
        }
    }
    Ok(rejected)
}

/// Archives often wrap the package in one top-level folder
fn package_root(dest: &Path) -> PathBuf {
    if dest.join(MANIFEST_FILE).is_file() {
        return dest.to_path_buf();
    }
    let dirs: Vec<PathBuf> = std::fs::read_dir(dest)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();
    match dirs.as_slice() {
        [only] if only.join(MANIFEST_FILE).is_file() => only.clone(),
        _ => dest.to_path_buf(),
    }
}

/// Tool that runs a packaged script through the sandbox
struct SkillScriptTool {
    spec: SkillToolSpec,
    script: PathBuf,
    sandbox: Arc<dyn Sandbox>,
    timeout: Duration,
    max_output_bytes: usize,
}

#[async_trait]
impl Tool for SkillScriptTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn input_schema(&self) -> JsonValue {
        self.spec.schema()
    }

    async fn execute(&self, input: JsonValue) -> Result<ToolResult> {
        let request = ScriptRequest {
            script: self.script.clone(),
            input,
            timeout: self.timeout,
            max_output_bytes: self.max_output_bytes,
        };
        match self.sandbox.run(request).await {
            Ok(output) if output.success() => Ok(ToolResult::success(output.stdout)),
            Ok(output) => Ok(ToolResult::error(format!(
                "script exited with {}: {}",
                output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                if output.stderr.trim().is_empty() {
                    output.stdout
                } else {
                    output.stderr
                }
            ))),
            Err(Error::Timeout(msg)) => Ok(ToolResult::error(msg)),
            Err(e) => Err(e),
        }
    }
}

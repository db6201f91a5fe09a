//! Skill packages
//!
//! A skill is a `SKILL.md` manifest (YAML front matter plus markdown
//! instructions) shipped with optional scripts and resources, either as a
//! directory or a zip archive. Active skills contribute instructions to
//! prompts and script-backed tools to the tool manager.

pub mod loader;
pub mod manifest;
pub mod sandbox;
pub mod types;

pub use loader::CapabilityLoader;
pub use manifest::{MANIFEST_FILE, parse_manifest};
pub use sandbox::{ProcessSandbox, Sandbox, ScriptOutput, ScriptRequest};
pub use types::{SandboxPolicy, SkillManifest, SkillPackage, SkillScope, SkillToolSpec, ValidationResult};

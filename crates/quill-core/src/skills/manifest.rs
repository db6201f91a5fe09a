//! `SKILL.md` parsing
//!
//! ```text
//! ---
//! name: citation-helper
//! version: 1.2.0
//! provider: acme
//! tools:
//!   - name: format_citation
//!     script: scripts/format.sh
//! ---
//! Instructions in markdown...
//! ```
//!
//! Without front matter the first `# Heading` names the skill and the whole
//! file becomes its instructions.

use regex::Regex;

use super::{SandboxPolicy, SkillManifest};
use crate::{Error, Result};

pub const MANIFEST_FILE: &str = "SKILL.md";

/// Split `---` front matter from the body
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let front = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('-');
    Some((front, body))
}

pub fn parse_manifest(content: &str) -> Result<SkillManifest> {
    let content = content.trim_start_matches('\u{feff}');

    let mut manifest = match split_front_matter(content) {
        Some((front, body)) => {
            let mut manifest: SkillManifest = serde_yaml::from_str(front)
                .map_err(|e| Error::SkillValidation(format!("invalid front matter in {}: {}", MANIFEST_FILE, e)))?;
            if manifest.instructions.trim().is_empty() {
                manifest.instructions = body.trim().to_string();
            }
            manifest
        }
        None => {
            let heading = Regex::new(r"(?m)^#\s+(.+)$")
                .map_err(|e| Error::Other(e.to_string()))?;
            let name = heading
                .captures(content)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .ok_or_else(|| Error::SkillValidation(format!("no skill name found in {}", MANIFEST_FILE)))?;
            SkillManifest {
                name,
                version: "1.0.0".to_string(),
                provider: "custom".to_string(),
                namespace: None,
                description: String::new(),
                instructions: content.to_string(),
                resources: Vec::new(),
                tools: Vec::new(),
                sandbox: SandboxPolicy::default(),
            }
        }
    };

    manifest.name = manifest.name.trim().to_string();
    manifest.instructions = manifest.instructions.trim().to_string();
    Ok(manifest)
}

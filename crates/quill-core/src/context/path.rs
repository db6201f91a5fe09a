//! Hierarchical context paths

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A validated store path such as `/drafts/chapter-1.md`
///
/// Always starts with `/`, never ends with one, and has no empty, `.`/`..`,
/// or dot-prefixed segments. Dot-prefixed names are reserved for snapshot
/// bookkeeping on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContextPath(String);

impl ContextPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Err(Error::InvalidInput("context path must name an entry".into()));
        }

        let mut normalized = String::with_capacity(trimmed.len() + 1);
        for segment in trimmed.trim_start_matches('/').split('/') {
            validate_segment(raw, segment)?;
            normalized.push('/');
            normalized.push_str(segment);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0[1..].split('/')
    }

    /// Relative filesystem path under the store root
    pub fn to_relative(&self) -> PathBuf {
        self.segments().collect()
    }

    /// Whether this path lives under `prefix` (segment-wise, so `/drafts` does not match `/drafts2/a`)
    pub fn is_under(&self, prefix: &str) -> bool {
        let prefix = prefix.trim().trim_end_matches('/');
        let prefix = prefix.trim_start_matches('/');
        if prefix.is_empty() {
            return true;
        }
        let own = &self.0[1..];
        own == prefix || (own.starts_with(prefix) && own[prefix.len()..].starts_with('/'))
    }
}

fn validate_segment(raw: &str, segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::InvalidInput(format!("empty segment in path {:?}", raw)));
    }
    if segment.starts_with('.') {
        return Err(Error::InvalidInput(format!(
            "segment {:?} in path {:?} may not start with '.'",
            segment, raw
        )));
    }
    if segment.contains(['\\', '\0']) {
        return Err(Error::InvalidInput(format!("invalid character in path {:?}", raw)));
    }
    Ok(())
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContextPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContextPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for ContextPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<ContextPath> for String {
    fn from(value: ContextPath) -> Self {
        value.0
    }
}

impl AsRef<str> for ContextPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_leading_slash() {
        assert_eq!(ContextPath::parse("drafts/v1.md").unwrap().as_str(), "/drafts/v1.md");
        assert_eq!(ContextPath::parse("/drafts/v1.md").unwrap().as_str(), "/drafts/v1.md");
    }

    #[test]
    fn test_rejects_traversal_and_hidden_segments() {
        for bad in ["", "/", "/drafts/../secret", "/drafts//x", "/.versions/a", "/a/./b", "/a\\b"] {
            assert!(ContextPath::parse(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_is_under_is_segment_aware() {
        let path = ContextPath::parse("/drafts/ch1.md").unwrap();
        assert!(path.is_under("/drafts"));
        assert!(path.is_under("/drafts/"));
        assert!(path.is_under("/"));
        assert!(path.is_under(""));
        assert!(path.is_under("/drafts/ch1.md"));
        assert!(!path.is_under("/draft"));
        assert!(!path.is_under("/references"));
    }

    #[test]
    fn test_serde_validates() {
        let ok: ContextPath = serde_json::from_str("\"/refs/notes.md\"").unwrap();
        assert_eq!(ok.to_relative(), PathBuf::from("refs/notes.md"));
        assert!(serde_json::from_str::<ContextPath>("\"/../etc\"").is_err());
    }
}

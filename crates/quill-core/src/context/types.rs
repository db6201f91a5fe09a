//! Context store value types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ContextPath;

/// One immutable version of an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub path: ContextPath,
    pub content: String,
    pub version: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Snapshot metadata, as kept in the per-path version index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Length in characters
    pub chars: usize,
}

/// Outcome of a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub path: ContextPath,
    pub version: u64,
    /// The content is over the externalization threshold and must be passed by reference
    pub externalized: bool,
    pub chars: usize,
}

/// Replace lines `start_line..=end_line` (1-based) with `new_content`
///
/// An empty `new_content` deletes the range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEdit {
    pub start_line: usize,
    pub end_line: usize,
    #[serde(default)]
    pub new_content: String,
}

impl LineEdit {
    pub fn new(start_line: usize, end_line: usize, new_content: impl Into<String>) -> Self {
        Self {
            start_line,
            end_line,
            new_content: new_content.into(),
        }
    }
}

/// A grep hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrepMatch {
    pub path: ContextPath,
    /// 1-based line number
    pub line: usize,
    pub text: String,
}

/// What a prompt builder may embed for a piece of content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextRef {
    Inline { content: String },
    External {
        path: ContextPath,
        version: u64,
        chars: usize,
    },
}

impl ContextRef {
    pub fn is_external(&self) -> bool {
        matches!(self, ContextRef::External { .. })
    }

    /// Text to place in a prompt
    pub fn render(&self) -> String {
        match self {
            ContextRef::Inline { content } => content.clone(),
            ContextRef::External {
                path,
                version,
                chars,
            } => format!(
                "[stored externally at {} (version {}, {} characters); read it with context_read]",
                path, version, chars
            ),
        }
    }
}

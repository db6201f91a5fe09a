//! Memory type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    StyleProfile,
    GlossaryTerm,
    Generic,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::StyleProfile => "style_profile",
            MemoryKind::GlossaryTerm => "glossary_term",
            MemoryKind::Generic => "generic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "style_profile" => Some(MemoryKind::StyleProfile),
            "glossary_term" => Some(MemoryKind::GlossaryTerm),
            "generic" => Some(MemoryKind::Generic),
            _ => None,
        }
    }

    /// Tag every record of this kind carries
    pub fn default_tag(&self) -> &'static str {
        match self {
            MemoryKind::StyleProfile => "style",
            MemoryKind::GlossaryTerm => "glossary",
            MemoryKind::Generic => "generic",
        }
    }
}

/// A long-lived fact, unique per (owner, kind, key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MemoryKind,
    pub owner: String,
    pub key: String,
    pub value: JsonValue,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Writing-style features extracted from samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    pub sample_count: usize,
    /// Average sample length in characters
    pub avg_length: f64,
    pub avg_word_count: f64,
    pub avg_sentence_words: f64,
    pub avg_paragraphs: f64,
    /// Coarse label: concise, balanced or elaborate
    pub tone: String,
}

impl StyleProfile {
    /// Compute features from raw text samples
    pub fn analyze<S: AsRef<str>>(samples: &[S]) -> Self {
        let n = samples.len().max(1) as f64;
        let mut chars = 0usize;
        let mut words = 0usize;
        let mut sentences = 0usize;
        let mut paragraphs = 0usize;

        for sample in samples {
            let text = sample.as_ref();
            chars += text.chars().count();
            words += text.split_whitespace().count();
            sentences += text
                .split(['.', '!', '?', '。', '！', '？'])
                .filter(|s| !s.trim().is_empty())
                .count();
            paragraphs += text
                .split("\n\n")
                .filter(|p| !p.trim().is_empty())
                .count();
        }

        let avg_sentence_words = if sentences == 0 {
            0.0
        } else {
            words as f64 / sentences as f64
        };
        let tone = if avg_sentence_words < 12.0 {
            "concise"
        } else if avg_sentence_words > 25.0 {
            "elaborate"
        } else {
            "balanced"
        };

        Self {
            sample_count: samples.len(),
            avg_length: chars as f64 / n,
            avg_word_count: words as f64 / n,
            avg_sentence_words,
            avg_paragraphs: paragraphs as f64 / n,
            tone: tone.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_samples() {
        let samples = [
            "Short one. Another short one.",
            "A much longer sentence that keeps going with many many words in it and never seems to stop at all.",
        ];
        let profile = StyleProfile::analyze(&samples);
        assert_eq!(profile.sample_count, 2);
        assert!(profile.avg_length > 20.0);
        assert_eq!(profile.avg_paragraphs, 1.0);
        // 5 + 20 words over 3 sentences
        assert!((profile.avg_sentence_words - 25.0 / 3.0).abs() < 1e-9);
        assert_eq!(profile.tone, "concise");
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [MemoryKind::StyleProfile, MemoryKind::GlossaryTerm, MemoryKind::Generic] {
            assert_eq!(MemoryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MemoryKind::parse("other"), None);
    }
}

//! Sub-agent types

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::ContextPath;
use crate::planner::{TaskId, TaskKind};

/// Unique identifier for a sub-agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubAgentId(pub String);

impl SubAgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SubAgentId {
    fn default() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for SubAgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Specialisation of a sub-agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentType {
    Research,
    Translation,
    Editing,
    FactCheck,
    Summarize,
}

impl SubAgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Translation => "translation",
            Self::Editing => "editing",
            Self::FactCheck => "fact_check",
            Self::Summarize => "summarize",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "research" => Some(Self::Research),
            "translation" | "translate" => Some(Self::Translation),
            "editing" | "edit" => Some(Self::Editing),
            "fact_check" => Some(Self::FactCheck),
            "summarize" | "summary" => Some(Self::Summarize),
            _ => None,
        }
    }

    /// Sub-agent type that handles a task kind, if the kind is delegable
    pub fn for_task_kind(kind: TaskKind) -> Option<Self> {
        match kind {
            TaskKind::Research => Some(Self::Research),
            TaskKind::Translate => Some(Self::Translation),
            TaskKind::Edit => Some(Self::Editing),
            TaskKind::FactCheck => Some(Self::FactCheck),
            TaskKind::Outline | TaskKind::Draft | TaskKind::Publish => None,
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::Research => {
                "You are a research assistant. Gather the facts, sources and background the task asks for \
                 and report them as concise, well-organised markdown notes. Cite where each fact comes from."
            }
            Self::Translation => {
                "You are a professional translator. Translate the material faithfully, keeping tone, \
                 formatting and terminology consistent. Output only the translation."
            }
            Self::Editing => {
                "You are a careful editor. Improve clarity, flow and correctness while keeping the author's \
                 voice. Output the revised text followed by a short list of the main changes."
            }
            Self::FactCheck => {
                "You are a fact checker. List every checkable claim in the material, mark each as supported, \
                 unsupported or wrong, and explain briefly."
            }
            Self::Summarize => {
                "You summarise material. Produce a faithful summary that keeps the key points and drops detail."
            }
        }
    }
}

impl fmt::Display for SubAgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of delegated work
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentTask {
    pub id: SubAgentId,
    pub agent_type: SubAgentType,
    /// Plan task this work belongs to
    pub task_id: TaskId,
    pub description: String,
    /// The only context paths the worker may read
    pub allowed_paths: Vec<ContextPath>,
    /// The only path the worker may write
    pub result_path: ContextPath,
    pub timeout: Duration,
}

/// Lifecycle of a spawned sub-agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubAgentState {
    Spawned,
    Running,
    /// Result written as `version` of the result path
    Completed { version: u64 },
    Failed { reason: String },
    Cancelled,
}

impl SubAgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubAgentState::Completed { .. } | SubAgentState::Failed { .. } | SubAgentState::Cancelled
        )
    }
}

/// What `collect` found for a sub-agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collected {
    /// Result content, read back from the context store
    Ready(String),
    Pending,
    Failed(String),
}

//! Plan and task types

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ContextPath;

/// Unique identifier for a plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task id, unique within a plan and assigned in insertion order
pub type TaskId = u64;

/// What kind of writing step a task is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Outline,
    #[default]
    Draft,
    Research,
    Edit,
    Translate,
    FactCheck,
    Publish,
}

impl TaskKind {
    /// Lenient parse for model output
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "outline" => TaskKind::Outline,
            "research" => TaskKind::Research,
            "edit" | "editing" | "revise" => TaskKind::Edit,
            "translate" | "translation" => TaskKind::Translate,
            "fact_check" | "factcheck" | "verify" => TaskKind::FactCheck,
            "publish" => TaskKind::Publish,
            _ => TaskKind::Draft,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Outline => "outline",
            TaskKind::Draft => "draft",
            TaskKind::Research => "research",
            TaskKind::Edit => "edit",
            TaskKind::Translate => "translate",
            TaskKind::FactCheck => "fact_check",
            TaskKind::Publish => "publish",
        }
    }
}

/// Priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "low" => TaskPriority::Low,
            "high" | "critical" => TaskPriority::High,
            _ => TaskPriority::Medium,
        }
    }
}

/// Status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of work inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    /// Tasks that must complete before this one may start
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default = "default_cost")]
    pub estimated_cost: u32,
    /// Times the task has been started
    #[serde(default)]
    pub attempts: u32,
    /// Where the task's output was written
    #[serde(default)]
    pub result_path: Option<ContextPath>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Removed by replanning; kept for history, never runnable again
    #[serde(default)]
    pub retired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_cost() -> u32 {
    1
}

/// Input for adding a task to a plan
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub dependencies: Vec<TaskId>,
    pub estimated_cost: u32,
}

impl NewTask {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            estimated_cost: 1,
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    pub fn cost(mut self, cost: u32) -> Self {
        self.estimated_cost = cost;
        self
    }
}

/// A goal decomposed into a dependency graph of tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub goal: String,
    pub tasks: BTreeMap<TaskId, Task>,
    /// Id the next inserted task receives
    pub next_id: TaskId,
    /// Task most recently handed out by `next`/`start`
    #[serde(default)]
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub abandoned: bool,
    /// Planner's summary of the goal, when it gave one
    #[serde(default)]
    pub analysis: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counts by status, ignoring retired tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanProgress {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl PlanProgress {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

//! Replanning change sets
//!
//! A change set is applied to a copy of the plan and only swapped in if every
//! change succeeds and the result is still a DAG.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{NewTask, Plan, TaskId, TaskKind, TaskPriority};
use crate::{Error, Result};

/// Reference to a task from inside a change set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskRef {
    /// An existing task id
    Id(TaskId),
    /// The `key` of a task inserted earlier in the same change set
    New(String),
}

/// One structural change to a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanChange {
    Insert {
        #[serde(default)]
        key: Option<String>,
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default, alias = "type")]
        kind: Option<String>,
        #[serde(default)]
        priority: Option<String>,
        #[serde(default)]
        dependencies: Vec<TaskRef>,
        #[serde(default)]
        estimated_cost: Option<u32>,
    },
    Remove {
        task: TaskRef,
    },
    AddDependency {
        task: TaskRef,
        depends_on: TaskRef,
    },
    RemoveDependency {
        task: TaskRef,
        depends_on: TaskRef,
    },
}

/// What a change set did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub inserted: Vec<TaskId>,
    pub removed: Vec<TaskId>,
    pub edges_added: usize,
    pub edges_removed: usize,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.removed.is_empty()
            && self.edges_added == 0
            && self.edges_removed == 0
    }
}

fn resolve(r: &TaskRef, keys: &HashMap<String, TaskId>) -> Result<TaskId> {
    match r {
        TaskRef::Id(id) => Ok(*id),
        TaskRef::New(key) => keys
            .get(key)
            .copied()
            .ok_or_else(|| Error::Planning(format!("unknown task key {:?}", key))),
    }
}

/// Existing task ids a change set removes
pub fn removed_task_ids(changes: &[PlanChange]) -> Vec<TaskId> {
    changes
        .iter()
        .filter_map(|c| match c {
            PlanChange::Remove {
                task: TaskRef::Id(id),
            } => Some(*id),
            _ => None,
        })
        .collect()
}

impl Plan {
    /// Apply a change set atomically
    pub fn apply_changes(&mut self, changes: &[PlanChange]) -> Result<ChangeSummary> {
        let mut draft = self.clone();
        let mut keys: HashMap<String, TaskId> = HashMap::new();
        let mut summary = ChangeSummary::default();

        for change in changes {
            match change {
                PlanChange::Insert {
                    key,
                    title,
                    description,
                    kind,
                    priority,
                    dependencies,
                    estimated_cost,
                } => {
                    let deps = dependencies
                        .iter()
                        .map(|d| resolve(d, &keys))
                        .collect::<Result<Vec<_>>>()?;
                    let spec = NewTask {
                        title: title.clone(),
                        description: description.clone(),
                        kind: kind.as_deref().map(TaskKind::parse).unwrap_or_default(),
                        priority: priority.as_deref().map(TaskPriority::parse).unwrap_or_default(),
                        dependencies: deps,
                        estimated_cost: estimated_cost.unwrap_or(1),
                    };
                    let id = draft.add_task(spec)?;
                    if let Some(key) = key {
                        if keys.insert(key.clone(), id).is_some() {
                            return Err(Error::Planning(format!("duplicate task key {:?}", key)));
                        }
                    }
                    summary.inserted.push(id);
                }
                PlanChange::Remove { task } => {
                    let id = resolve(task, &keys)?;
                    draft.retire(id, "removed during replanning")?;
                    summary.removed.push(id);
                }
                PlanChange::AddDependency { task, depends_on } => {
                    let id = resolve(task, &keys)?;
                    let dep = resolve(depends_on, &keys)?;
                    draft.add_dependency(id, dep)?;
                    summary.edges_added += 1;
                }
                PlanChange::RemoveDependency { task, depends_on } => {
                    let id = resolve(task, &keys)?;
                    let dep = resolve(depends_on, &keys)?;
                    draft.remove_dependency(id, dep)?;
                    summary.edges_removed += 1;
                }
            }
        }

        draft.check_acyclic()?;
        if draft.active_tasks().next().is_none() {
            return Err(Error::Planning("replanning would leave no tasks".into()));
        }

        *self = draft;
        info!(
            plan = %self.id,
            inserted = summary.inserted.len(),
            removed = summary.removed.len(),
            edges_added = summary.edges_added,
            edges_removed = summary.edges_removed,
            "Plan changes applied"
        );
        Ok(summary)
    }
}

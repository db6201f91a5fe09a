//! Plan mutation and the per-task state machine
//!
//! Every mutation that touches edges re-runs the topological check and is
//! rolled back if it fails.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;

use super::graph::topological_order;
use super::{NewTask, Plan, PlanId, PlanProgress, Task, TaskId, TaskStatus};
use crate::context::ContextPath;
use crate::{Error, Result};

impl Plan {
    pub fn new(goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: PlanId::default(),
            goal: goal.into(),
            tasks: BTreeMap::new(),
            next_id: 1,
            current_task: None,
            abandoned: false,
            analysis: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a plan from task specs; dependencies refer to ids in the returned plan
    pub fn with_tasks(goal: impl Into<String>, tasks: Vec<NewTask>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(Error::Planning("a plan needs at least one task".into()));
        }
        let mut plan = Self::new(goal);
        for spec in tasks {
            plan.insert_unchecked(spec);
        }
        plan.check_acyclic()?;
        Ok(plan)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn insert_unchecked(&mut self, spec: NewTask) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        let now = Utc::now();
        self.tasks.insert(
            id,
            Task {
                id,
                title: spec.title,
                description: spec.description,
                kind: spec.kind,
                priority: spec.priority,
                status: TaskStatus::Pending,
                dependencies: spec.dependencies.into_iter().collect(),
                estimated_cost: spec.estimated_cost.max(1),
                attempts: 0,
                result_path: None,
                failure_reason: None,
                retired: false,
                created_at: now,
                updated_at: now,
            },
        );
        self.touch();
        id
    }

    /// Fail with `Error::Planning` unless the graph is a DAG over known ids
    pub fn check_acyclic(&self) -> Result<()> {
        topological_order(&self.tasks).map(|_| ())
    }

    /// A dependency target must exist and must not be retired
    fn check_dependency_target(&self, depends_on: TaskId) -> Result<()> {
        match self.tasks.get(&depends_on) {
            None => Err(Error::Planning(format!("unknown dependency {}", depends_on))),
            Some(dep) if dep.retired => Err(Error::Planning(format!(
                "task {} was removed and cannot be depended on",
                depends_on
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Only pending tasks may be rewired
    fn check_rewirable(&self, task_id: TaskId, action: &str) -> Result<()> {
        let task = self.task(task_id)?;
        if task.status != TaskStatus::Pending || task.retired {
            return Err(Error::Planning(format!(
                "cannot {} task {} in status {}",
                action, task_id, task.status
            )));
        }
        Ok(())
    }

    /// Append a task
    pub fn add_task(&mut self, spec: NewTask) -> Result<TaskId> {
        for dep in &spec.dependencies {
            self.check_dependency_target(*dep)?;
        }
        let id = self.insert_unchecked(spec);
        if let Err(e) = self.check_acyclic() {
            self.tasks.remove(&id);
            self.next_id -= 1;
            return Err(e);
        }
        Ok(id)
    }

    /// Make `task_id` wait for `depends_on`
    pub fn add_dependency(&mut self, task_id: TaskId, depends_on: TaskId) -> Result<()> {
        self.check_dependency_target(depends_on)?;
        self.check_rewirable(task_id, "add a dependency to")?;
        let task = self.task_mut(task_id)?;
        if !task.dependencies.insert(depends_on) {
            return Ok(());
        }
        if let Err(e) = self.check_acyclic() {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.dependencies.remove(&depends_on);
            }
            return Err(e);
        }
        self.touch();
        Ok(())
    }

    pub fn remove_dependency(&mut self, task_id: TaskId, depends_on: TaskId) -> Result<()> {
        self.check_rewirable(task_id, "remove a dependency from")?;
        let task = self.task_mut(task_id)?;
        task.dependencies.remove(&depends_on);
        self.touch();
        Ok(())
    }

    /// Retire a task: it stays in history as failed and nothing waits on it any more
    pub fn retire(&mut self, task_id: TaskId, reason: &str) -> Result<()> {
        let task = self.task(task_id)?;
        match task.status {
            TaskStatus::Completed => {
                return Err(Error::Planning(format!(
                    "task {} is completed and cannot be removed",
                    task_id
                )));
            }
            TaskStatus::InProgress => {
                return Err(Error::Planning(format!(
                    "task {} is running; cancel it before removing it",
                    task_id
                )));
            }
            TaskStatus::Pending | TaskStatus::Failed => {}
        }

        let now = Utc::now();
        for other in self.tasks.values_mut() {
            if other.dependencies.remove(&task_id) {
                other.updated_at = now;
            }
        }
        let task = self.task_mut(task_id)?;
        task.status = TaskStatus::Failed;
        task.retired = true;
        task.failure_reason = Some(reason.to_string());
        task.updated_at = now;
        self.touch();
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Result<&Task> {
        self.tasks
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("task {} in plan {}", id, self.id)))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        let plan_id = self.id.clone();
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("task {} in plan {}", id, plan_id)))
    }

    /// Tasks that are still part of the plan
    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| !t.retired)
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Lowest-id pending task whose dependencies are all completed
    pub fn next_runnable(&self) -> Option<&Task> {
        if self.abandoned {
            return None;
        }
        self.active_tasks()
            .find(|t| t.status == TaskStatus::Pending && self.dependencies_met(t))
    }

    /// All runnable tasks, lowest id first
    pub fn runnable(&self) -> Vec<&Task> {
        if self.abandoned {
            return Vec::new();
        }
        self.active_tasks()
            .filter(|t| t.status == TaskStatus::Pending && self.dependencies_met(t))
            .collect()
    }

    /// All live tasks completed, or the goal abandoned
    pub fn is_terminal(&self) -> bool {
        self.abandoned || self.active_tasks().all(|t| t.status == TaskStatus::Completed)
    }

    /// Incomplete tasks remain but none can start and none is running
    pub fn is_blocked(&self) -> bool {
        !self.is_terminal()
            && self.next_runnable().is_none()
            && !self.active_tasks().any(|t| t.status == TaskStatus::InProgress)
    }

    pub fn progress(&self) -> PlanProgress {
        let mut progress = PlanProgress::default();
        for task in self.active_tasks() {
            match task.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::InProgress => progress.in_progress += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
            }
        }
        progress
    }

    fn transition(&mut self, id: TaskId, to: TaskStatus) -> Result<&mut Task> {
        let task = self.task_mut(id)?;
        let from = task.status;
        let allowed = !task.retired
            && matches!(
                (from, to),
                (TaskStatus::Pending, TaskStatus::InProgress)
                    | (TaskStatus::InProgress, TaskStatus::Completed)
                    | (TaskStatus::InProgress, TaskStatus::Failed)
                    | (TaskStatus::Failed, TaskStatus::Pending)
            );
        if !allowed {
            return Err(Error::InvalidTransition(format!(
                "task {}: {} -> {}{}",
                id,
                from,
                to,
                if task.retired { " (retired)" } else { "" }
            )));
        }
        debug!(task = id, %from, %to, "Task transition");
        task.status = to;
        task.updated_at = Utc::now();
        Ok(task)
    }

    /// pending -> in_progress; dependencies must be completed
    pub fn start(&mut self, id: TaskId) -> Result<()> {
        let task = self.task(id)?;
        if !self.dependencies_met(task) {
            return Err(Error::InvalidTransition(format!(
                "task {} still has unfinished dependencies",
                id
            )));
        }
        let task = self.transition(id, TaskStatus::InProgress)?;
        task.attempts += 1;
        task.failure_reason = None;
        self.current_task = Some(id);
        self.touch();
        Ok(())
    }

    /// in_progress -> completed
    pub fn complete(&mut self, id: TaskId, result_path: Option<ContextPath>) -> Result<()> {
        let task = self.transition(id, TaskStatus::Completed)?;
        if result_path.is_some() {
            task.result_path = result_path;
        }
        if self.current_task == Some(id) {
            self.current_task = None;
        }
        self.touch();
        Ok(())
    }

    /// in_progress -> failed
    pub fn fail(&mut self, id: TaskId, reason: impl Into<String>) -> Result<()> {
        let task = self.transition(id, TaskStatus::Failed)?;
        task.failure_reason = Some(reason.into());
        if self.current_task == Some(id) {
            self.current_task = None;
        }
        self.touch();
        Ok(())
    }

    /// failed -> pending, on an explicit retry decision
    pub fn retry(&mut self, id: TaskId) -> Result<()> {
        self.transition(id, TaskStatus::Pending)?;
        self.touch();
        Ok(())
    }

    /// Put tasks interrupted mid-run back to pending; returns their ids
    pub fn reset_interrupted(&mut self) -> Vec<TaskId> {
        let now = Utc::now();
        let mut reset = Vec::new();
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.updated_at = now;
                reset.push(task.id);
            }
        }
        if !reset.is_empty() {
            self.current_task = None;
            self.touch();
        }
        reset
    }

    pub fn abandon(&mut self) {
        self.abandoned = true;
        self.current_task = None;
        self.touch();
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize and re-validate the graph
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: Plan = serde_json::from_str(json)?;
        plan.check_acyclic()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::TaskKind;

    fn outline_plan() -> Plan {
        Plan::with_tasks(
            "draft a 3-section outline",
            vec![
                NewTask::new("Research", "gather sources").kind(TaskKind::Research),
                NewTask::new("Outline", "three sections").kind(TaskKind::Outline).depends_on([1]),
                NewTask::new("Review", "check flow").kind(TaskKind::Edit).depends_on([2]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_completion_unblocks_dependents() {
        let mut plan = outline_plan();
        assert_eq!(plan.next_runnable().unwrap().id, 1);

        plan.start(1).unwrap();
        assert!(plan.next_runnable().is_none());
        assert!(!plan.is_blocked());

        plan.complete(1, None).unwrap();
        assert_eq!(plan.next_runnable().unwrap().id, 2);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut plan = outline_plan();
        assert!(matches!(plan.complete(1, None), Err(Error::InvalidTransition(_))));
        assert!(matches!(plan.start(2), Err(Error::InvalidTransition(_))));
        assert!(matches!(plan.retry(1), Err(Error::InvalidTransition(_))));
    }

    #[test]
    fn test_failure_blocks_until_retry() {
        let mut plan = outline_plan();
        plan.start(1).unwrap();
        plan.fail(1, "source unavailable").unwrap();

        assert!(plan.next_runnable().is_none());
        assert!(plan.is_blocked());
        assert!(!plan.is_terminal());

        plan.retry(1).unwrap();
        assert_eq!(plan.next_runnable().unwrap().id, 1);
        plan.start(1).unwrap();
        assert_eq!(plan.task(1).unwrap().attempts, 2);
        assert!(plan.task(1).unwrap().failure_reason.is_none());
    }

    #[test]
    fn test_add_dependency_rejects_cycle_and_rolls_back() {
        let mut plan = outline_plan();
        let err = plan.add_dependency(1, 3).unwrap_err();
        assert!(matches!(err, Error::Planning(_)));
        assert!(plan.task(1).unwrap().dependencies.is_empty());
        plan.check_acyclic().unwrap();
    }

    #[test]
    fn test_only_pending_tasks_can_be_rewired() {
        let mut plan = outline_plan();
        plan.start(1).unwrap();
        plan.complete(1, None).unwrap();
        plan.start(2).unwrap();

        for id in [1, 2] {
            assert!(matches!(plan.remove_dependency(id, 1), Err(Error::Planning(_))));
        }
        assert!(plan.task(2).unwrap().dependencies.contains(&1));

        plan.remove_dependency(3, 2).unwrap();
        assert!(plan.task(3).unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_retired_task_cannot_be_depended_on() {
        let mut plan = outline_plan();
        plan.retire(3, "not needed").unwrap();

        let err = plan.add_task(NewTask::new("Epilogue", "").depends_on([3])).unwrap_err();
        assert!(matches!(err, Error::Planning(_)));
        assert_eq!(plan.tasks.len(), 3);

        assert!(matches!(plan.add_dependency(2, 3), Err(Error::Planning(_))));
        assert!(!plan.task(2).unwrap().dependencies.contains(&3));
    }

    #[test]
    fn test_with_tasks_rejects_cycle_and_empty() {
        let cyclic = Plan::with_tasks(
            "loop",
            vec![NewTask::new("a", "").depends_on([2]), NewTask::new("b", "").depends_on([1])],
        );
        assert!(matches!(cyclic, Err(Error::Planning(_))));
        assert!(Plan::with_tasks("nothing", vec![]).is_err());
    }

    #[test]
    fn test_retire_frees_dependents_and_protects_completed() {
        let mut plan = outline_plan();
        plan.start(1).unwrap();
        plan.complete(1, None).unwrap();
        assert!(plan.retire(1, "obsolete").is_err());

        plan.retire(2, "removed during replanning").unwrap();
        let retired = plan.task(2).unwrap();
        assert!(retired.retired);
        assert_eq!(retired.status, TaskStatus::Failed);
        assert!(plan.task(3).unwrap().dependencies.is_empty());
        assert_eq!(plan.next_runnable().unwrap().id, 3);
    }

    #[test]
    fn test_terminal_ignores_retired_tasks() {
        let mut plan = outline_plan();
        for id in [1, 2] {
            plan.start(id).unwrap();
            plan.complete(id, None).unwrap();
        }
        plan.retire(3, "not needed").unwrap();
        assert!(plan.is_terminal());
        assert_eq!(plan.progress().total(), 2);
    }

    #[test]
    fn test_json_round_trip_and_resume() {
        let mut plan = outline_plan();
        plan.start(1).unwrap();
        let json = plan.to_json().unwrap();

        let mut restored = Plan::from_json(&json).unwrap();
        assert_eq!(restored, plan);
        assert_eq!(restored.reset_interrupted(), vec![1]);
        assert_eq!(restored.next_runnable().unwrap().id, 1);
    }
}

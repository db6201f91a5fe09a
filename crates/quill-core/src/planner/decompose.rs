//! Goal decomposition and replanning through the completion collaborator

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use super::{NewTask, Plan, PlanChange, TaskKind, TaskPriority, TaskStatus};
use crate::llm::{Completion, CompletionOptions};
use crate::{Error, Result};

const PLAN_SYSTEM_PROMPT: &str = r#"You are a writing task planner. Break the user's writing goal into concrete, actionable tasks.

Respond with JSON only, in this shape:
{
  "analysis": "one-paragraph analysis of the goal",
  "tasks": [
    {
      "title": "Task title",
      "description": "What to do and what to produce",
      "type": "outline|draft|research|edit|translate|fact_check|publish",
      "priority": "low|medium|high",
      "estimated_cost": 1,
      "dependencies": []
    }
  ]
}

"dependencies" lists the zero-based positions of other tasks in this list that must finish first.
The tasks must form a directed acyclic graph."#;

const REPLAN_SYSTEM_PROMPT: &str = r#"You maintain an existing writing plan. Given the plan and new information, answer with JSON only:
{
  "changes": [
    {"op": "insert", "key": "k1", "title": "...", "description": "...", "type": "draft", "dependencies": [2, "k0"]},
    {"op": "remove", "task": 5},
    {"op": "add_dependency", "task": 4, "depends_on": "k1"},
    {"op": "remove_dependency", "task": 4, "depends_on": 2}
  ]
}
Numbers are existing task ids; strings are keys of tasks inserted earlier in the same list.
Never remove or rewire completed tasks. Return {"changes": []} if nothing needs to change."#;

/// Fallback title when the model's plan cannot be parsed
pub const FALLBACK_TASK_TITLE: &str = "Complete the writing goal";

#[derive(Debug, Deserialize)]
struct DraftPlan {
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default)]
    tasks: Vec<DraftTask>,
}

#[derive(Debug, Deserialize)]
struct DraftTask {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "type")]
    kind: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    estimated_cost: Option<u32>,
    #[serde(default)]
    dependencies: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct DraftChanges {
    #[serde(default)]
    changes: Vec<PlanChange>,
}

/// Slice out the outermost JSON object, tolerating code fences and chatter around it
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Decomposes goals into plans and revises them
pub struct TaskPlanner {
    llm: Arc<dyn Completion>,
}

impl TaskPlanner {
    pub fn new(llm: Arc<dyn Completion>) -> Self {
        Self { llm }
    }

    /// Produce a plan with at least one task
    ///
    /// An unparseable answer falls back to a single task carrying the goal.
    /// A parseable answer whose dependencies are out of range or cyclic is a
    /// `Error::Planning`.
    pub async fn plan(&self, goal: &str, context: Option<&str>) -> Result<Plan> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(Error::InvalidInput("goal must not be empty".into()));
        }

        let mut prompt = format!("Goal: {}", goal);
        if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
            prompt.push_str("\n\nContext: ");
            prompt.push_str(ctx);
        }

        let response = self
            .llm
            .complete(&prompt, &CompletionOptions::with_system(PLAN_SYSTEM_PROMPT))
            .await?;

        let draft = extract_json(&response)
            .and_then(|json| serde_json::from_str::<DraftPlan>(json).ok())
            .filter(|d| !d.tasks.is_empty());

        let plan = match draft {
            Some(draft) => Self::build(goal, draft)?,
            None => {
                warn!("Planner response was not a usable plan, falling back to a single task");
                let mut plan = Plan::with_tasks(
                    goal,
                    vec![NewTask::new(FALLBACK_TASK_TITLE, goal).priority(TaskPriority::High)],
                )?;
                plan.analysis = Some("Could not parse structured response".to_string());
                plan
            }
        };

        info!(plan = %plan.id, tasks = plan.tasks.len(), "Plan created");
        Ok(plan)
    }

    fn build(goal: &str, draft: DraftPlan) -> Result<Plan> {
        let count = draft.tasks.len();
        let mut specs = Vec::with_capacity(count);

        for (index, task) in draft.tasks.into_iter().enumerate() {
            let mut deps = Vec::with_capacity(task.dependencies.len());
            for dep in task.dependencies {
                if dep >= count {
                    return Err(Error::Planning(format!(
                        "task {} depends on position {} but the plan has {} tasks",
                        index, dep, count
                    )));
                }
                // ids are assigned from 1 in list order
                deps.push(dep as u64 + 1);
            }
            specs.push(NewTask {
                title: task.title.unwrap_or_else(|| format!("Task {}", index + 1)),
                description: task.description,
                kind: task.kind.as_deref().map(TaskKind::parse).unwrap_or_default(),
                priority: task.priority.as_deref().map(TaskPriority::parse).unwrap_or_default(),
                dependencies: deps,
                estimated_cost: task.estimated_cost.unwrap_or(1),
            });
        }

        let mut plan = Plan::with_tasks(goal, specs)?;
        plan.analysis = draft.analysis;
        Ok(plan)
    }

    /// Ask for a change set in light of `new_info` and return the revised plan
    ///
    /// The input plan is not modified; a rejected change set surfaces as
    /// `Error::Planning`.
    pub async fn replan(&self, plan: &Plan, new_info: &str) -> Result<Plan> {
        let changes = self.propose_changes(plan, new_info).await?;
        let mut revised = plan.clone();
        revised.apply_changes(&changes)?;
        Ok(revised)
    }

    /// Ask for a change set without applying it
    pub async fn propose_changes(&self, plan: &Plan, new_info: &str) -> Result<Vec<PlanChange>> {
        let prompt = format!(
            "Goal: {}\n\nCurrent tasks:\n{}\n\nNew information:\n{}",
            plan.goal,
            describe_tasks(plan),
            new_info
        );
        let response = self
            .llm
            .complete(&prompt, &CompletionOptions::with_system(REPLAN_SYSTEM_PROMPT))
            .await?;

        let json = extract_json(&response)
            .ok_or_else(|| Error::Planning("replanning response contained no JSON".into()))?;
        let draft: DraftChanges = serde_json::from_str(json)
            .map_err(|e| Error::Planning(format!("unreadable change set: {}", e)))?;
        Ok(draft.changes)
    }
}

/// One line per live task, for prompts
pub fn describe_tasks(plan: &Plan) -> String {
    plan.active_tasks()
        .map(|t| {
            let deps: Vec<String> = t.dependencies.iter().map(|d| d.to_string()).collect();
            format!(
                "- [{}] #{} {} ({}){}",
                match t.status {
                    TaskStatus::Completed => "x",
                    TaskStatus::InProgress => "~",
                    TaskStatus::Failed => "!",
                    TaskStatus::Pending => " ",
                },
                t.id,
                t.title,
                t.kind.as_str(),
                if deps.is_empty() {
                    String::new()
                } else {
                    format!(" after {}", deps.join(", "))
                }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Canned(String);

    #[async_trait]
    impl Completion for Canned {
        async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn planner(answer: &str) -> TaskPlanner {
        TaskPlanner::new(Arc::new(Canned(answer.to_string())))
    }

    #[tokio::test]
    async fn test_three_section_outline() {
        let answer = r#"Here is the plan:
```json
{
  "analysis": "A short outline in three parts",
  "tasks": [
    {"title": "Section 1", "description": "Intro", "type": "outline", "dependencies": []},
    {"title": "Section 2", "description": "Body", "type": "outline", "dependencies": [0]},
    {"title": "Section 3", "description": "Conclusion", "type": "outline", "dependencies": [1]}
  ]
}
```"#;
        let mut plan = planner(answer).plan("draft a 3-section outline", None).await.unwrap();

        assert!(plan.tasks.len() >= 3);
        plan.check_acyclic().unwrap();
        assert_eq!(plan.next_runnable().unwrap().id, 1);

        plan.start(1).unwrap();
        plan.complete(1, None).unwrap();
        assert_eq!(plan.next_runnable().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_unparseable_answer_falls_back() {
        let plan = planner("I would start by thinking hard.")
            .plan("write a haiku", None)
            .await
            .unwrap();
        assert_eq!(plan.tasks.len(), 1);
        let task = plan.task(1).unwrap();
        assert_eq!(task.title, FALLBACK_TASK_TITLE);
        assert_eq!(task.description, "write a haiku");
    }

    #[tokio::test]
    async fn test_cyclic_answer_is_rejected() {
        let answer = r#"{"tasks": [
            {"title": "a", "dependencies": [1]},
            {"title": "b", "dependencies": [0]}
        ]}"#;
        let err = planner(answer).plan("loop", None).await.unwrap_err();
        assert!(matches!(err, Error::Planning(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_dependency_is_rejected() {
        let answer = r#"{"tasks": [{"title": "a", "dependencies": [4]}]}"#;
        assert!(planner(answer).plan("x", None).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_goal_is_user_error() {
        let err = planner("{}").plan("   ", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_replan_returns_revised_copy() {
        let original = Plan::with_tasks(
            "essay",
            vec![NewTask::new("Outline", ""), NewTask::new("Draft", "").depends_on([1])],
        )
        .unwrap();

        let answer = r#"{"changes": [
            {"op": "insert", "key": "r", "title": "Research new source", "type": "research"},
            {"op": "add_dependency", "task": 2, "depends_on": "r"}
        ]}"#;
        let revised = planner(answer).replan(&original, "a new source appeared").await.unwrap();

        assert_eq!(original.tasks.len(), 2);
        assert_eq!(revised.tasks.len(), 3);
        assert!(revised.task(2).unwrap().dependencies.contains(&3));
    }

    #[test]
    fn test_describe_tasks() {
        let plan = Plan::with_tasks(
            "essay",
            vec![NewTask::new("Outline", ""), NewTask::new("Draft", "").depends_on([1])],
        )
        .unwrap();
        let text = describe_tasks(&plan);
        assert!(text.contains("#1 Outline (draft)"));
        assert!(text.contains("#2 Draft (draft) after 1"));
    }
}

//! Task execution
//!
//! Delegable kinds run in a sub-agent that sees only the results of the
//! task's dependencies. Everything else is a direct completion call that may
//! request tools with `TOOL_CALL <name> <json>` lines. Anything headed for a
//! prompt goes through `prepare_for_prompt` first.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use quill_core::skills::SkillScope;
use quill_core::{
    Collected, Completion, CompletionOptions, ContextPath, ContextStore, Error, MemoryStore, OrchestratorConfig,
    PlanId, Result, SubAgentType, Task, TaskKind, ToolResult,
};

use crate::runtime::RuntimeRegistry;

const WRITER: &str = "orchestrator";

const DIRECT_SYSTEM_PROMPT: &str = "You are a writing assistant carrying out one step of a larger writing plan. \
Produce the deliverable the task asks for, in markdown, and nothing else.

To use a tool, answer with one line per call in the form
TOOL_CALL <tool_name> <json arguments>
and no other text. The results come back in the next message. Material marked as stored externally can be read with the context_read tool.";

/// How a task execution ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result_path: Option<ContextPath> },
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn completed(result_path: ContextPath) -> Self {
        TaskOutcome::Completed {
            result_path: Some(result_path),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        TaskOutcome::Failed { reason: reason.into() }
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    /// Parsed arguments, or the parse error to report back
    pub arguments: std::result::Result<JsonValue, String>,
}

/// Extract `TOOL_CALL <name> <json>` lines
pub fn parse_tool_calls(text: &str) -> Vec<ToolCallRequest> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("TOOL_CALL "))
        .filter_map(|rest| {
            let rest = rest.trim();
            let (name, args) = match rest.split_once(char::is_whitespace) {
                Some((name, args)) => (name, args.trim()),
                None => (rest, ""),
            };
            if name.is_empty() {
                return None;
            }
            let arguments = if args.is_empty() {
                Ok(JsonValue::Object(Default::default()))
            } else {
                serde_json::from_str(args).map_err(|e| format!("invalid JSON arguments: {}", e))
            };
            Some(ToolCallRequest {
                name: name.to_string(),
                arguments,
            })
        })
        .collect()
}

fn strip_tool_calls(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("TOOL_CALL "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Runs single tasks; shared by every plan of an orchestrator
pub struct TaskExecutor {
    store: ContextStore,
    llm: Arc<dyn Completion>,
    runtime: Arc<RuntimeRegistry>,
    memory: Option<Arc<MemoryStore>>,
    config: OrchestratorConfig,
    scope: SkillScope,
}

impl TaskExecutor {
    pub fn new(
        store: ContextStore,
        llm: Arc<dyn Completion>,
        runtime: Arc<RuntimeRegistry>,
        memory: Option<Arc<MemoryStore>>,
        config: OrchestratorConfig,
        scope: SkillScope,
    ) -> Self {
        Self {
            store,
            llm,
            runtime,
            memory,
            config,
            scope,
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.config.task_timeout_secs.max(1))
    }

    fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tool_timeout_secs.max(1))
    }

    /// Where a task's deliverable is written
    pub fn result_path(plan_id: &PlanId, task: &Task) -> Result<ContextPath> {
        let area = match task.kind {
            TaskKind::Research | TaskKind::FactCheck => "references",
            _ => "drafts",
        };
        ContextPath::parse(&format!("/{}/plans/{}/task-{}.md", area, plan_id, task.id))
    }

    /// Memory and skill instructions for the owner, best effort
    pub async fn preamble(&self) -> String {
        let mut sections = Vec::new();
        let owner = &self.config.owner;

        if let Some(memory) = &self.memory {
            match memory.style_profile(owner) {
                Ok(Some(profile)) => sections.push(format!(
                    "## Writing style\nTone: {}. Sentences average {:.0} words; pieces average {:.0} words in {:.0} paragraphs.",
                    profile.tone, profile.avg_sentence_words, profile.avg_word_count, profile.avg_paragraphs
                )),
                Ok(None) => {}
                Err(e) => warn!(owner = %owner, error = %e, "Style profile unavailable"),
            }

            match memory.load(owner, &["glossary"]) {
                Ok(records) if !records.is_empty() => {
                    let lines: Vec<String> = records
                        .iter()
                        .map(|r| {
                            let definition = r.value.get("definition").and_then(|d| d.as_str()).unwrap_or("");
                            format!("- {}: {}", r.key, definition)
                        })
                        .collect();
                    sections.push(format!("## Glossary\n{}", lines.join("\n")));
                }
                Ok(_) => {}
                Err(e) => warn!(owner = %owner, error = %e, "Glossary unavailable"),
            }
        }

        let instructions = self.runtime.skills().lock().await.effective_instructions(&self.scope);
        if !instructions.is_empty() {
            sections.push(format!("## Skills\n{}", instructions));
        }

        sections.join("\n\n")
    }

    /// Run one task to an outcome; errors become failures
    pub async fn execute(&self, plan_id: &PlanId, goal: &str, task: &Task, inputs: &[ContextPath]) -> TaskOutcome {
        let result = match SubAgentType::for_task_kind(task.kind) {
            Some(agent_type) => self.delegate(plan_id, goal, task, agent_type, inputs).await,
            None => self.execute_direct(plan_id, goal, task, inputs).await,
        };
        match result {
            Ok(path) => TaskOutcome::completed(path),
            Err(e) => {
                warn!(plan = %plan_id, task = task.id, error = %e, "Task execution failed");
                TaskOutcome::failed(e.to_string())
            }
        }
    }

    async fn delegate(
        &self,
        plan_id: &PlanId,
        goal: &str,
        task: &Task,
        agent_type: SubAgentType,
        inputs: &[ContextPath],
    ) -> Result<ContextPath> {
        let result_path = Self::result_path(plan_id, task)?;
        let mut description = String::new();
        let preamble = self.preamble().await;
        if !preamble.is_empty() {
            let path = ContextPath::parse(&format!("/todos/preambles/{}.md", plan_id))?;
            description.push_str(&self.store.prepare_for_prompt(&path, &preamble, WRITER).await?.render());
            description.push_str("\n\n");
        }
        let goal_ref = self.goal_reference(plan_id, goal).await?;
        description.push_str(&format!(
            "Overall goal: {}\n\nTask #{}: {}\n{}",
            goal_ref, task.id, task.title, task.description
        ));

        let agents = self.runtime.agents();
        let sub = agents.spawn(agent_type, task.id, &description, inputs.to_vec(), Some(result_path.clone()))?;
        self.runtime.track_agent(plan_id, task.id, sub.id.clone());
        info!(plan = %plan_id, task = task.id, agent = %sub.id, kind = %agent_type, "Task delegated");

        match agents.collect(&sub.id, true).await? {
            Collected::Ready(_) => Ok(result_path),
            Collected::Failed(reason) => Err(Error::Other(format!("sub-agent {} failed: {}", sub.id, reason))),
            Collected::Pending => Err(Error::Other(format!("sub-agent {} did not finish", sub.id))),
        }
    }

    async fn goal_reference(&self, plan_id: &PlanId, goal: &str) -> Result<String> {
        let path = ContextPath::parse(&format!("/todos/goals/{}.md", plan_id))?;
        Ok(self.store.prepare_for_prompt(&path, goal, WRITER).await?.render())
    }

    /// Prompt for a directly executed task
    pub async fn build_prompt(&self, plan_id: &PlanId, goal: &str, task: &Task, inputs: &[ContextPath]) -> Result<String> {
        let mut prompt = String::new();

        let preamble = self.preamble().await;
        if !preamble.is_empty() {
            let path = ContextPath::parse(&format!("/todos/preambles/{}.md", plan_id))?;
            prompt.push_str(&self.store.prepare_for_prompt(&path, &preamble, WRITER).await?.render());
            prompt.push_str("\n\n");
        }

        prompt.push_str(&format!("## Goal\n{}\n\n", self.goal_reference(plan_id, goal).await?));
        prompt.push_str(&format!("## Task #{}: {}\n{}\n", task.id, task.title, task.description));

        if !inputs.is_empty() {
            prompt.push_str("\n## Inputs\n");
            for path in inputs {
                let reference = self.store.reference(path).await?;
                prompt.push_str(&format!("### {}\n{}\n\n", path, reference.render()));
            }
        }

        let definitions = self.runtime.tools().read().await.definitions();
        if !definitions.is_empty() {
            prompt.push_str("\n## Tools\n");
            for def in definitions {
                prompt.push_str(&format!("- {}: {} Arguments: {}\n", def.name, def.description, def.input_schema));
            }
        }
        Ok(prompt)
    }

    async fn execute_direct(&self, plan_id: &PlanId, goal: &str, task: &Task, inputs: &[ContextPath]) -> Result<ContextPath> {
        let result_path = Self::result_path(plan_id, task)?;
        let options = CompletionOptions::with_system(DIRECT_SYSTEM_PROMPT);
        let mut transcript = self.build_prompt(plan_id, goal, task, inputs).await?;
        let rounds = self.config.max_tool_rounds;

        let mut round = 0;
        let output = loop {
            let response = self.llm.complete(&transcript, &options).await?;
            let calls = parse_tool_calls(&response);
            if calls.is_empty() {
                break response;
            }
            if round >= rounds {
                warn!(plan = %plan_id, task = task.id, rounds, "Tool round limit reached");
                break strip_tool_calls(&response);
            }

            let scratch = |name: &str| {
                ContextPath::parse(&format!("/todos/scratch/{}/task-{}/round-{}-{}", plan_id, task.id, round, name))
            };
            let echoed = self
                .store
                .prepare_for_prompt(&scratch("response.md")?, &response, WRITER)
                .await?;
            transcript.push_str(&format!("\n\n## Your previous answer\n{}", echoed.render()));

            for (i, call) in calls.iter().enumerate() {
                let output = self.run_tool_call(call).await;
                let rendered = self
                    .store
                    .prepare_for_prompt(&scratch(&format!("tool-{}.txt", i))?, &output, WRITER)
                    .await?;
                transcript.push_str(&format!("\n\n## Tool result: {}\n{}", call.name, rendered.render()));
            }
            round += 1;
        };

        let output = output.trim();
        if output.is_empty() {
            return Err(Error::LlmApi("model returned no content".into()));
        }
        let receipt = self.store.write(&result_path, output, WRITER).await?;
        debug!(
            plan = %plan_id,
            task = task.id,
            version = receipt.version,
            externalized = receipt.externalized,
            "Task result written"
        );
        Ok(result_path)
    }

    async fn run_tool_call(&self, call: &ToolCallRequest) -> String {
        let args = match &call.arguments {
            Ok(args) => args.clone(),
            Err(e) => return format!("error: {}", e),
        };
        match self.runtime.invoke_tool(&call.name, args, self.tool_timeout()).await {
            Ok(ToolResult { output, is_error: false }) => output,
            Ok(ToolResult { output, is_error: true }) => format!("error: {}", output),
            Err(e) => format!("error: {}", e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use quill_core::planner::NewTask;
    use quill_core::{CapabilityLoader, LlmSubAgent, Plan, ProcessSandbox, SubAgentManager, Tool, ToolManager};
    use quill_mcp::McpRegistry;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned answers and records every prompt
    pub(crate) struct Scripted {
        pub answers: Mutex<VecDeque<String>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        pub fn new(answers: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Completion for Scripted {
        async fn complete(&self, prompt: &str, _options: &CompletionOptions) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self
                .answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "done".to_string()))
        }
    }

    struct Shout;

    #[async_trait]
    impl Tool for Shout {
        fn name(&self) -> &str {
            "shout"
        }
        fn description(&self) -> &str {
            "Upper-cases text."
        }
        fn input_schema(&self) -> JsonValue {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, input: JsonValue) -> Result<ToolResult> {
            Ok(ToolResult::success(input["text"].as_str().unwrap_or("").to_uppercase()))
        }
    }

    fn executor(dir: &std::path::Path, llm: Arc<Scripted>, memory: Option<Arc<MemoryStore>>) -> (ContextStore, TaskExecutor) {
        let store = ContextStore::open(dir.join("ws"), 1_000).unwrap();
        let mut tools = ToolManager::new();
        tools.register_builtin(Arc::new(Shout));
        let agents = Arc::new(SubAgentManager::new(store.clone(), Arc::new(LlmSubAgent::new(llm.clone())), 2));
        let runtime = Arc::new(RuntimeRegistry::new(
            tools,
            McpRegistry::default(),
            CapabilityLoader::new(Arc::new(ProcessSandbox::default()), dir.join("skills")),
            agents,
        ));
        let executor = TaskExecutor::new(
            store.clone(),
            llm,
            runtime,
            memory,
            OrchestratorConfig::default(),
            SkillScope::Global,
        );
        (store, executor)
    }

    fn task(kind: TaskKind) -> Task {
        let plan = Plan::with_tasks("essay", vec![NewTask::new("Step", "Do the step").kind(kind)]).unwrap();
        plan.task(1).unwrap().clone()
    }

    #[test]
    fn test_parse_tool_calls() {
        let calls = parse_tool_calls(
            "Let me check.\nTOOL_CALL shout {\"text\": \"hi\"}\n  TOOL_CALL context_ls\nTOOL_CALL bad {oops",
        );
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].name, "shout");
        assert_eq!(calls[0].arguments, Ok(json!({"text": "hi"})));
        assert_eq!(calls[1].arguments, Ok(json!({})));
        assert!(calls[2].arguments.is_err());
        assert!(parse_tool_calls("no calls here").is_empty());
    }

    #[tokio::test]
    async fn test_direct_execution_with_tool_round() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Scripted::new(&["TOOL_CALL shout {\"text\": \"title\"}", "# TITLE\n\nBody."]);
        let (store, executor) = executor(dir.path(), llm.clone(), None);
        let plan_id = PlanId::new("p1");

        let outcome = executor.execute(&plan_id, "essay", &task(TaskKind::Draft), &[]).await;
        let path = ContextPath::parse("/drafts/plans/p1/task-1.md").unwrap();
        assert_eq!(outcome, TaskOutcome::completed(path.clone()));
        assert_eq!(store.read(&path, None).await.unwrap(), "# TITLE\n\nBody.");

        let prompts = llm.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("- shout: Upper-cases text."));
        assert!(prompts[1].contains("## Tool result: shout\nTITLE"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_to_model() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Scripted::new(&["TOOL_CALL nope {}", "final"]);
        let (_store, executor) = executor(dir.path(), llm.clone(), None);

        let outcome = executor
            .execute(&PlanId::new("p1"), "essay", &task(TaskKind::Outline), &[])
            .await;
        assert!(matches!(outcome, TaskOutcome::Completed { .. }));
        assert!(llm.prompts.lock().unwrap()[1].contains("error: Not found: Unknown tool: nope"));
    }

    #[tokio::test]
    async fn test_oversized_input_is_referenced_not_inlined() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Scripted::new(&["ok"]);
        let (store, executor) = executor(dir.path(), llm.clone(), None);

        let big = "x".repeat(5_000);
        let input = ContextPath::parse("/drafts/big.md").unwrap();
        store.write(&input, &big, "user").await.unwrap();

        executor
            .execute(&PlanId::new("p1"), "essay", &task(TaskKind::Publish), std::slice::from_ref(&input))
            .await;
        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(!prompt.contains(&big));
        assert!(prompt.contains("[stored externally at /drafts/big.md (version 1, 5000 characters)"));
    }

    #[tokio::test]
    async fn test_delegated_task_sees_only_its_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Scripted::new(&["research notes"]);
        let (store, executor) = executor(dir.path(), llm.clone(), None);

        let visible = ContextPath::parse("/drafts/plans/p1/task-0.md").unwrap();
        let hidden = ContextPath::parse("/drafts/secret.md").unwrap();
        store.write(&visible, "visible outline", "user").await.unwrap();
        store.write(&hidden, "hidden text", "user").await.unwrap();

        let outcome = executor
            .execute(&PlanId::new("p1"), "essay", &task(TaskKind::Research), std::slice::from_ref(&visible))
            .await;
        let path = ContextPath::parse("/references/plans/p1/task-1.md").unwrap();
        assert_eq!(outcome, TaskOutcome::completed(path.clone()));
        assert_eq!(store.read(&path, None).await.unwrap(), "research notes");

        let prompt = llm.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("visible outline"));
        assert!(!prompt.contains("hidden text"));
    }

    #[tokio::test]
    async fn test_preamble_carries_memory() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryStore::in_memory().unwrap());
        memory
            .store_glossary_term("default", "kenning", "a compound metaphor", &[])
            .unwrap();
        memory
            .store_style_profile("default", &["Short. Plain. Direct."], &[])
            .unwrap();

        let (_store, executor) = executor(dir.path(), Scripted::new(&[]), Some(memory));
        let preamble = executor.preamble().await;
        assert!(preamble.contains("## Writing style"));
        assert!(preamble.contains("- kenning: a compound metaphor"));
    }

    #[tokio::test]
    async fn test_empty_answer_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, executor) = executor(dir.path(), Scripted::new(&["   "]), None);
        let outcome = executor
            .execute(&PlanId::new("p1"), "essay", &task(TaskKind::Draft), &[])
            .await;
        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    }
}

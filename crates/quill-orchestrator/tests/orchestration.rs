//! End-to-end orchestration against a scripted model

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use quill_core::planner::NewTask;
use quill_core::skills::SkillScope;
use quill_core::{
    CapabilityLoader, Completion, CompletionOptions, ContextPath, ContextStore, Error, LlmSubAgent, MemoryStore,
    OrchestratorConfig, Plan, PlanId, ProcessSandbox, Result, SubAgentManager, SubAgentType, TaskKind, TaskStatus,
    ToolManager,
};
use quill_mcp::McpRegistry;
use quill_orchestrator::{Checkpoints, ImportPolicy, Orchestrator, PortableConfig, RunStatus, RuntimeRegistry};

/// Answers planner calls with canned JSON and task calls with "Result of task N"
struct MockLlm {
    plan: Mutex<String>,
    changes: Mutex<String>,
    /// Task prompts containing SLOW stall while this is set
    slow: AtomicBool,
    /// Task prompts containing BIG get this answer
    big: String,
    prompts: Mutex<Vec<String>>,
}

impl MockLlm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(r#"{"tasks": [{"title": "Only", "description": "do it"}]}"#.into()),
            changes: Mutex::new(r#"{"changes": []}"#.into()),
            slow: AtomicBool::new(true),
            big: "lorem ipsum dolor sit amet\n".repeat(800),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn set_plan(&self, json: &str) {
        *self.plan.lock().unwrap() = json.to_string();
    }

    fn set_changes(&self, json: &str) {
        *self.changes.lock().unwrap() = json.to_string();
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

fn task_number(prompt: &str) -> Option<u64> {
    let start = prompt.find("Task #")? + "Task #".len();
    let digits: String = prompt[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[async_trait]
impl Completion for MockLlm {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String> {
        let system = options.system.clone().unwrap_or_default();
        if system.starts_with("You are a writing task planner") {
            return Ok(self.plan.lock().unwrap().clone());
        }
        if system.starts_with("You maintain an existing writing plan") {
            return Ok(self.changes.lock().unwrap().clone());
        }

        self.prompts.lock().unwrap().push(prompt.to_string());
        if prompt.contains("SLOW") && self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if prompt.contains("BIG") {
            return Ok(self.big.clone());
        }
        Ok(match task_number(prompt) {
            Some(n) => format!("Result of task {}", n),
            None => "Result".to_string(),
        })
    }
}

fn orchestrator(dir: &Path, llm: Arc<MockLlm>) -> Arc<Orchestrator> {
    let store = ContextStore::open(dir.join("workspace"), 10_000).unwrap();
    let mut tools = ToolManager::new();
    quill_tools::register_context_tools(&mut tools, store.clone(), "orchestrator");
    let agents = SubAgentManager::new(store.clone(), Arc::new(LlmSubAgent::new(llm.clone())), 4);
    let runtime = RuntimeRegistry::new(
        tools,
        McpRegistry::default(),
        CapabilityLoader::new(Arc::new(ProcessSandbox::default()), dir.join("skills")),
        Arc::new(agents),
    );
    Arc::new(Orchestrator::new(
        store,
        llm,
        Arc::new(runtime),
        Some(Arc::new(MemoryStore::in_memory().unwrap())),
        OrchestratorConfig::default(),
        SkillScope::Workspace("test".into()),
    ))
}

async fn wait_until<F: Fn(&Plan) -> bool>(orch: &Orchestrator, id: &PlanId, check: F) {
    for _ in 0..500 {
        if check(&orch.plan(id).await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("plan {} never reached the expected state", id);
}

#[tokio::test]
async fn test_three_section_outline_runs_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new();
    llm.set_plan(
        r#"{"analysis": "three sections", "tasks": [
            {"title": "Introduction", "description": "Outline the intro", "type": "outline", "dependencies": []},
            {"title": "Body", "description": "Outline the body", "type": "outline", "dependencies": [0]},
            {"title": "Conclusion", "description": "Outline the end", "type": "outline", "dependencies": [1]}
        ]}"#,
    );
    let orch = orchestrator(dir.path(), llm.clone());

    let plan = orch.create_plan("draft a 3-section outline").await.unwrap();
    assert_eq!(plan.tasks.len(), 3);
    assert_eq!(plan.next_runnable().unwrap().id, 1);

    let report = orch.run(&plan.id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.progress.completed, 3);

    let done = orch.plan(&plan.id).await.unwrap();
    for id in 1..=3 {
        let path = done.task(id).unwrap().result_path.clone().unwrap();
        assert_eq!(
            orch.store().read(&path, None).await.unwrap(),
            format!("Result of task {}", id)
        );
    }

    // each section sees the one before it
    let prompts = llm.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[1].contains("Result of task 1"));
    assert!(prompts[2].contains("Result of task 2"));

    // checkpoint matches the live plan
    let checkpoint = Checkpoints::new(orch.store().clone()).load(&plan.id).await.unwrap();
    assert!(checkpoint.is_terminal());

    let summaries = orch.query_memory("default", &["plan-summary"]).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].value["goal"], "draft a 3-section outline");
}

#[tokio::test]
async fn test_large_draft_is_passed_by_reference() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new();
    llm.set_plan(
        r#"{"tasks": [
            {"title": "Draft", "description": "BIG chapter", "type": "draft"},
            {"title": "Polish", "description": "Tighten the chapter", "type": "edit", "dependencies": [0]}
        ]}"#,
    );
    let orch = orchestrator(dir.path(), llm.clone());
    let plan = orch.create_plan("write a long chapter").await.unwrap();

    let report = orch.run(&plan.id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let done = orch.plan(&plan.id).await.unwrap();
    let draft = done.task(1).unwrap().result_path.clone().unwrap();
    let entry = orch.store().read_entry(&draft, None).await.unwrap();
    assert!(entry.content.chars().count() > 20_000);

    let edited = done.task(2).unwrap().result_path.clone().unwrap();
    assert!(edited.as_str().starts_with("/drafts/plans/"));

    // the editing sub-agent got a reference, never the draft itself
    let prompts = llm.prompts();
    let edit_prompt = prompts.iter().find(|p| p.contains("Tighten the chapter")).unwrap();
    assert!(!edit_prompt.contains(&llm.big));
    assert!(edit_prompt.contains(&format!("[stored externally at {}", draft)));
}

#[tokio::test]
async fn test_two_agents_writing_one_path_keep_both_versions() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new();
    let orch = orchestrator(dir.path(), llm);
    let notes = ContextPath::parse("/refs/notes.md").unwrap();

    let agents = orch.runtime().agents();
    let a = agents
        .spawn(SubAgentType::Research, 1, "Task #1: notes", vec![], Some(notes.clone()))
        .unwrap();
    let b = agents
        .spawn(SubAgentType::Research, 2, "Task #2: notes", vec![], Some(notes.clone()))
        .unwrap();
    agents.coordinate(&[a.id, b.id]).await.unwrap();

    let versions = orch.store().versions(&notes).unwrap();
    assert_eq!(versions.len(), 2);
    let mut contents = vec![
        orch.store().read(&notes, Some(1)).await.unwrap(),
        orch.store().read(&notes, Some(2)).await.unwrap(),
    ];
    contents.sort();
    assert_eq!(contents, vec!["Result of task 1", "Result of task 2"]);
}

#[tokio::test]
async fn test_replan_stops_removed_running_task() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new();
    llm.set_plan(r#"{"tasks": [{"title": "Slow draft", "description": "SLOW", "type": "draft"}]}"#);
    llm.set_changes(
        r#"{"changes": [
            {"op": "remove", "task": 1},
            {"op": "insert", "key": "n", "title": "Fresh draft", "description": "new angle", "type": "draft"}
        ]}"#,
    );
    let orch = orchestrator(dir.path(), llm.clone());
    let plan = orch.create_plan("essay").await.unwrap();

    let runner = {
        let orch = orch.clone();
        let id = plan.id.clone();
        tokio::spawn(async move { orch.run(&id).await })
    };
    wait_until(&orch, &plan.id, |p| p.task(1).unwrap().status == TaskStatus::InProgress).await;

    let summary = orch.replan(&plan.id, "the angle changed").await.unwrap();
    assert_eq!(summary.removed, vec![1]);
    assert_eq!(summary.inserted, vec![2]);

    let report = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let done = orch.plan(&plan.id).await.unwrap();
    let removed = &done.tasks[&1];
    assert!(removed.retired);
    assert_eq!(removed.failure_reason.as_deref(), Some("cancelled for replanning"));
    assert_eq!(done.task(2).unwrap().status, TaskStatus::Completed);
    assert!(orch.runtime().is_idle());
}

#[tokio::test]
async fn test_cancel_then_resume() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new();
    llm.set_plan(
        r#"{"tasks": [
            {"title": "Research", "description": "SLOW sources", "type": "research"},
            {"title": "Draft", "description": "write", "type": "draft", "dependencies": [0]}
        ]}"#,
    );
    let orch = orchestrator(dir.path(), llm.clone());
    let plan = orch.create_plan("essay").await.unwrap();

    let runner = {
        let orch = orch.clone();
        let id = plan.id.clone();
        tokio::spawn(async move { orch.run(&id).await })
    };
    wait_until(&orch, &plan.id, |p| p.task(1).unwrap().status == TaskStatus::InProgress).await;
    for _ in 0..500 {
        if orch.runtime().agents().active_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    orch.cancel(&plan.id).await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(orch.runtime().agents().active_count(), 0);

    let checkpoint = Checkpoints::new(orch.store().clone()).load(&plan.id).await.unwrap();
    assert_eq!(checkpoint.task(1).unwrap().status, TaskStatus::Pending);
    assert!(orch.get_next_task(&plan.id).await.unwrap().is_none());

    llm.slow.store(false, Ordering::SeqCst);
    let report = orch.resume(&plan.id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.progress.completed, 2);
}

#[tokio::test]
async fn test_resume_right_after_cancel_runs_each_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new();
    llm.set_plan(
        r#"{"tasks": [
            {"title": "Outline", "description": "SLOW outline", "type": "outline"},
            {"title": "Draft", "description": "write", "type": "draft", "dependencies": [0]}
        ]}"#,
    );
    let orch = orchestrator(dir.path(), llm.clone());
    let plan = orch.create_plan("essay").await.unwrap();

    let runner = {
        let orch = orch.clone();
        let id = plan.id.clone();
        tokio::spawn(async move { orch.run(&id).await })
    };
    wait_until(&orch, &plan.id, |p| p.task(1).unwrap().status == TaskStatus::InProgress).await;

    // no waiting for the first run to wind down
    orch.cancel(&plan.id).await.unwrap();
    llm.slow.store(false, Ordering::SeqCst);
    let resumed = orch.resume(&plan.id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);

    let first = runner.await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Cancelled);

    let prompts = llm.prompts();
    assert_eq!(prompts.iter().filter(|p| p.contains("Task #1")).count(), 2);
    assert_eq!(prompts.iter().filter(|p| p.contains("Task #2")).count(), 1);

    let done = orch.plan(&plan.id).await.unwrap();
    let draft = done.task(2).unwrap().result_path.clone().unwrap();
    assert_eq!(orch.store().versions(&draft).unwrap().len(), 1);
}

#[tokio::test]
async fn test_resume_after_restart_resets_interrupted_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new();
    let id = {
        let orch = orchestrator(dir.path(), llm.clone());
        let plan = orch.create_plan("essay").await.unwrap();
        orch.get_next_task(&plan.id).await.unwrap().unwrap();
        plan.id
    };

    // a fresh orchestrator only has the checkpoint
    let orch = orchestrator(dir.path(), llm);
    assert_eq!(orch.list_plans(), vec![id.clone()]);
    assert_eq!(
        orch.plan(&id).await.unwrap().task(1).unwrap().status,
        TaskStatus::InProgress
    );
    let report = orch.resume(&id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_tools_and_config_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path(), MockLlm::new());

    let written = orch
        .invoke_tool("context_write", json!({"path": "/refs/style.md", "content": "Plain words."}))
        .await
        .unwrap();
    assert!(!written.is_error);
    let read = orch
        .invoke_tool("context_read", json!({"path": "/refs/style.md"}))
        .await
        .unwrap();
    assert!(read.output.contains("Plain words."));

    let err = orch.invoke_tool("missing_tool", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let exported = orch.export_config().await;
    assert_eq!(exported.version, "1.0");
    let report = orch.import_config(&exported, ImportPolicy::Skip).await.unwrap();
    assert!(report.added.is_empty());

    let mut newer = exported.clone();
    newer.version = "2.0".into();
    assert!(orch.import_config(&newer, ImportPolicy::Merge).await.is_err());

    let reparsed = PortableConfig::from_json(&exported.to_json().unwrap()).unwrap();
    assert_eq!(reparsed.servers.len(), 0);
}

#[tokio::test]
async fn test_plan_built_by_hand_runs_delegated_and_direct_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let llm = MockLlm::new();
    let orch = orchestrator(dir.path(), llm.clone());

    let plan = Plan::with_tasks(
        "bilingual note",
        vec![
            NewTask::new("Write", "write the note").kind(TaskKind::Draft),
            NewTask::new("Translate", "into French").kind(TaskKind::Translate).depends_on([1]),
        ],
    )
    .unwrap();
    Checkpoints::new(orch.store().clone()).save(&plan).await.unwrap();

    let report = orch.run(&plan.id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    let done = orch.plan(&plan.id).await.unwrap();
    assert_eq!(
        orch.store()
            .read(done.task(2).unwrap().result_path.as_ref().unwrap(), None)
            .await
            .unwrap(),
        "Result of task 2"
    );
}

//! Orchestrator
//!
//! Owns the plans of a workspace and drives them: dispatch is serialized per
//! plan by an async mutex, while up to `max_concurrency` tasks execute at
//! once. Every transition is checkpointed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use quill_core::planner::{ChangeSummary, PlanProgress, removed_task_ids};
use quill_core::skills::SkillScope;
use quill_core::{
    CapabilityLoader, Completion, Config, ContextPath, ContextStore, Error, LlmSubAgent, MemoryRecord, MemoryStore,
    OrchestratorConfig, Plan, PlanId, ProcessSandbox, Result, SubAgentManager, Task, TaskId, TaskPlanner, TaskStatus,
    ToolManager, ToolResult,
};
use quill_mcp::initialize_mcp_tools;

use crate::checkpoint::Checkpoints;
use crate::executor::{TaskExecutor, TaskOutcome};
use crate::portable::{self, ImportPolicy, ImportReport, PortableConfig};
use crate::runtime::RuntimeRegistry;

const WRITER: &str = "orchestrator";

/// Why `run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every live task completed
    Completed,
    /// Work remains but nothing can start
    Blocked,
    Cancelled,
    Abandoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan_id: PlanId,
    pub status: RunStatus,
    pub progress: PlanProgress,
    /// Failed tasks with their reasons
    pub failed: Vec<(TaskId, String)>,
}

type PlanHandle = Arc<Mutex<Plan>>;

pub struct Orchestrator {
    store: ContextStore,
    planner: TaskPlanner,
    checkpoints: Checkpoints,
    executor: Arc<TaskExecutor>,
    runtime: Arc<RuntimeRegistry>,
    memory: Option<Arc<MemoryStore>>,
    plans: DashMap<PlanId, PlanHandle>,
    /// Held for the whole of a run loop; one loop per plan
    runs: DashMap<PlanId, Arc<Mutex<()>>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: ContextStore,
        llm: Arc<dyn Completion>,
        runtime: Arc<RuntimeRegistry>,
        memory: Option<Arc<MemoryStore>>,
        config: OrchestratorConfig,
        scope: SkillScope,
    ) -> Self {
        let executor = Arc::new(TaskExecutor::new(
            store.clone(),
            llm.clone(),
            runtime.clone(),
            memory.clone(),
            config.clone(),
            scope,
        ));
        Self {
            checkpoints: Checkpoints::new(store.clone()),
            store,
            planner: TaskPlanner::new(llm),
            executor,
            runtime,
            memory,
            plans: DashMap::new(),
            runs: DashMap::new(),
            config,
        }
    }

    /// Wire up a full orchestrator from configuration
    ///
    /// Memory and tool servers are optional: a memory database that cannot
    /// be opened is logged and skipped, unreachable servers stay registered
    /// in their error state.
    pub async fn bootstrap(config: &Config, llm: Arc<dyn Completion>) -> Result<Self> {
        config.validate()?;

        let workspace = config.workspace.dir();
        let store = ContextStore::open(&workspace, config.context.externalize_threshold)?;
        info!(workspace = %workspace.display(), "Context store opened");

        let memory = match MemoryStore::new(&config.memory.db_path) {
            Ok(memory) => Some(Arc::new(memory)),
            Err(e) => {
                warn!(path = %config.memory.db_path, error = %e, "Memory store unavailable");
                None
            }
        };

        let mut tools = ToolManager::new();
        quill_tools::register_context_tools(&mut tools, store.clone(), WRITER);
        let mcp = initialize_mcp_tools(&config.mcp, &mut tools).await?;

        let scope = SkillScope::Workspace(config.workspace.id.clone());
        let sandbox = Arc::new(ProcessSandbox::new(config.skills.sandbox_launcher.clone()));
        let extract_root = Path::new(&config.workspace.root).join(".skills").join(&config.workspace.id);
        let mut skills = CapabilityLoader::from_config(sandbox, extract_root, &config.skills);
        let dirs: Vec<PathBuf> = config.skills.dirs.iter().map(PathBuf::from).collect();
        for id in skills.load_dirs(&dirs).await? {
            if let Err(e) = skills.activate(&id, scope.clone(), &mut tools) {
                warn!(skill = %id, error = %e, "Skill not activated");
            }
        }

        let agents = SubAgentManager::new(
            store.clone(),
            Arc::new(LlmSubAgent::new(llm.clone())),
            config.orchestrator.max_concurrency,
        )
        .with_timeout(Duration::from_secs(config.orchestrator.task_timeout_secs.max(1)));

        let runtime = Arc::new(RuntimeRegistry::new(tools, mcp, skills, Arc::new(agents)));
        Ok(Self::new(
            store,
            llm,
            runtime,
            memory,
            config.orchestrator.clone(),
            scope,
        ))
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<RuntimeRegistry> {
        &self.runtime
    }

    /// In-memory plan, loaded from its checkpoint on first use
    async fn handle(&self, plan_id: &PlanId) -> Result<PlanHandle> {
        if let Some(handle) = self.plans.get(plan_id) {
            return Ok(handle.clone());
        }
        if !self.checkpoints.exists(plan_id) {
            return Err(Error::NotFound(format!("plan {}", plan_id)));
        }
        let plan = self.checkpoints.load(plan_id).await?;
        Ok(self
            .plans
            .entry(plan_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(plan)))
            .clone())
    }

    /// Current state of a plan
    pub async fn plan(&self, plan_id: &PlanId) -> Result<Plan> {
        Ok(self.handle(plan_id).await?.lock().await.clone())
    }

    pub fn list_plans(&self) -> Vec<PlanId> {
        self.checkpoints.list()
    }

    /// Decompose `goal` into a checkpointed plan
    pub async fn create_plan(&self, goal: &str) -> Result<Plan> {
        let preamble = self.executor.preamble().await;
        let context = if preamble.is_empty() {
            None
        } else {
            let path = ContextPath::parse("/todos/preambles/planning.md")?;
            Some(self.store.prepare_for_prompt(&path, &preamble, WRITER).await?.render())
        };

        let plan = self.planner.plan(goal, context.as_deref()).await?;
        self.checkpoints.save(&plan).await?;
        self.plans.insert(plan.id.clone(), Arc::new(Mutex::new(plan.clone())));
        Ok(plan)
    }

    /// Start the next runnable task and hand it out
    ///
    /// Returns `None` when nothing can start or the plan is cancelled.
    pub async fn get_next_task(&self, plan_id: &PlanId) -> Result<Option<Task>> {
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;
        self.start_next(&mut plan).await
    }

    async fn start_next(&self, plan: &mut Plan) -> Result<Option<Task>> {
        if self.runtime.is_cancelled(&plan.id) {
            return Ok(None);
        }
        let Some(task_id) = plan.next_runnable().map(|t| t.id) else {
            return Ok(None);
        };
        plan.start(task_id)?;
        self.checkpoints.save(plan).await?;
        Ok(Some(plan.task(task_id)?.clone()))
    }

    /// Record how a task ended
    ///
    /// A report for a task that is no longer in progress (stopped by a
    /// replan or a cancel) fails with `InvalidTransition` and changes nothing.
    pub async fn report_task_result(&self, plan_id: &PlanId, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        let result = self.record_outcome(plan_id, task_id, outcome).await;
        self.runtime.finish_task(plan_id, task_id);
        result
    }

    async fn record_outcome(&self, plan_id: &PlanId, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;
        match outcome {
            TaskOutcome::Completed { result_path } => {
                plan.complete(task_id, result_path)?;
                info!(plan = %plan_id, task = task_id, "Task completed");
            }
            TaskOutcome::Failed { reason } => {
                warn!(plan = %plan_id, task = task_id, reason = %reason, "Task failed");
                plan.fail(task_id, reason)?;
            }
        }
        self.checkpoints.save(&plan).await?;

        if plan.is_terminal() && !plan.abandoned {
            self.remember(&plan);
        }
        Ok(())
    }

    /// Store a `plan-summary` record for a finished plan, best effort
    fn remember(&self, plan: &Plan) {
        let Some(memory) = &self.memory else {
            return;
        };
        let tasks: Vec<JsonValue> = plan
            .active_tasks()
            .map(|t| {
                json!({
                    "id": t.id,
                    "title": t.title,
                    "kind": t.kind.as_str(),
                    "result_path": t.result_path,
                })
            })
            .collect();
        let value = json!({
            "plan_id": plan.id,
            "goal": plan.goal,
            "tasks": tasks,
            "completed_at": plan.updated_at,
        });
        let key = format!("plan-summary/{}", plan.id);
        if let Err(e) = memory.store_generic(&self.config.owner, &key, &value, &["plan-summary"]) {
            warn!(plan = %plan.id, error = %e, "Failed to store plan summary");
        }
    }

    /// Result paths of a task's completed dependencies
    fn dependency_inputs(&self, plan: &Plan, task: &Task) -> Vec<ContextPath> {
        task.dependencies
            .iter()
            .filter_map(|id| plan.task(*id).ok())
            .filter_map(|dep| dep.result_path.clone())
            .filter(|path| self.store.exists(path))
            .collect()
    }

    fn run_lock(&self, plan_id: &PlanId) -> Arc<Mutex<()>> {
        self.runs.entry(plan_id.clone()).or_default().clone()
    }

    /// Execute tasks until the plan is terminal, blocked or cancelled
    ///
    /// Fails with `InvalidInput` while another run of the same plan is live.
    pub async fn run(&self, plan_id: &PlanId) -> Result<RunReport> {
        let _run = self
            .run_lock(plan_id)
            .try_lock_owned()
            .map_err(|_| Error::InvalidInput(format!("plan {} is already running", plan_id)))?;
        self.drive(plan_id).await
    }

    async fn drive(&self, plan_id: &PlanId) -> Result<RunReport> {
        let handle = self.handle(plan_id).await?;
        let goal = handle.lock().await.goal.clone();
        let limit = self.config.max_concurrency.max(1);
        let timeout = self.executor.task_timeout();

        let mut running: JoinSet<(TaskOutcome, bool)> = JoinSet::new();
        let mut by_id: HashMap<tokio::task::Id, TaskId> = HashMap::new();
        info!(plan = %plan_id, limit, "Plan run started");

        loop {
            while running.len() < limit {
                // start, spawn and track under the plan lock so replan and
                // cancel never see a started task without its execution
                let mut plan = handle.lock().await;
                let Some(task) = self.start_next(&mut plan).await? else {
                    break;
                };
                let task_id = task.id;
                let inputs = self.dependency_inputs(&plan, &task);
                let executor = self.executor.clone();
                let pid = plan_id.clone();
                let goal = goal.clone();
                debug!(plan = %plan_id, task = task_id, kind = task.kind.as_str(), "Dispatching task");

                let abort = running.spawn(async move {
                    match tokio::time::timeout(timeout, executor.execute(&pid, &goal, &task, &inputs)).await {
                        Ok(outcome) => (outcome, false),
                        Err(_) => (
                            TaskOutcome::failed(format!("timed out after {}s", timeout.as_secs())),
                            true,
                        ),
                    }
                });
                by_id.insert(abort.id(), task_id);
                self.runtime.track_running(plan_id, task_id, abort);
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (task_id, outcome) = match joined {
                Ok((id, (outcome, timed_out))) => {
                    let Some(task_id) = by_id.remove(&id) else { continue };
                    if timed_out {
                        self.runtime.stop_task(plan_id, task_id).await;
                    }
                    (task_id, outcome)
                }
                Err(e) => {
                    let Some(task_id) = by_id.remove(&e.id()) else { continue };
                    if e.is_cancelled() {
                        // whoever stopped the task already settled its state
                        debug!(plan = %plan_id, task = task_id, "Task execution aborted");
                        continue;
                    }
                    (task_id, TaskOutcome::failed(format!("task execution panicked: {}", e)))
                }
            };

            if self.runtime.is_cancelled(plan_id) && matches!(outcome, TaskOutcome::Failed { .. }) {
                // cancel puts the task back to pending
                debug!(plan = %plan_id, task = task_id, "Failure of cancelled plan dropped");
                self.runtime.finish_task(plan_id, task_id);
                continue;
            }

            match self.report_task_result(plan_id, task_id, outcome).await {
                Ok(()) => {}
                Err(Error::InvalidTransition(reason)) => {
                    debug!(plan = %plan_id, task = task_id, reason = %reason, "Stale task report ignored");
                }
                Err(e) => {
                    self.runtime.stop_plan(plan_id).await;
                    running.abort_all();
                    return Err(e);
                }
            }
        }

        let plan = handle.lock().await;
        let status = if plan.abandoned {
            RunStatus::Abandoned
        } else if self.runtime.is_cancelled(plan_id) {
            RunStatus::Cancelled
        } else if plan.is_terminal() {
            RunStatus::Completed
        } else {
            RunStatus::Blocked
        };
        let failed = plan
            .active_tasks()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| (t.id, t.failure_reason.clone().unwrap_or_default()))
            .collect();
        let report = RunReport {
            plan_id: plan_id.clone(),
            status,
            progress: plan.progress(),
            failed,
        };
        info!(plan = %plan_id, status = ?report.status, completed = report.progress.completed, "Plan run finished");
        Ok(report)
    }

    /// Continue a plan from its latest checkpoint
    ///
    /// Tasks that were in progress when the plan stopped go back to pending.
    /// A cancelled run that is still winding down is waited for first.
    pub async fn resume(&self, plan_id: &PlanId) -> Result<RunReport> {
        if !self.runtime.running_tasks(plan_id).is_empty() {
            return Err(Error::InvalidInput(format!("plan {} is still running", plan_id)));
        }
        let _run = self.run_lock(plan_id).lock_owned().await;
        let mut plan = self.checkpoints.load(plan_id).await?;
        let reset = plan.reset_interrupted();
        if !reset.is_empty() {
            info!(plan = %plan_id, tasks = ?reset, "Interrupted tasks reset to pending");
        }
        self.checkpoints.save(&plan).await?;
        self.plans.insert(plan_id.clone(), Arc::new(Mutex::new(plan)));
        self.runtime.clear_cancelled(plan_id);
        self.drive(plan_id).await
    }

    /// Put a failed task back to pending
    pub async fn retry_task(&self, plan_id: &PlanId, task_id: TaskId) -> Result<()> {
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;
        plan.retry(task_id)?;
        self.checkpoints.save(&plan).await?;
        Ok(())
    }

    /// Revise a plan in light of new information
    ///
    /// Running tasks the revision removes are stopped and marked failed
    /// ("cancelled for replanning") before the change set is applied. A
    /// change set that does not apply leaves the plan untouched.
    pub async fn replan(&self, plan_id: &PlanId, new_info: &str) -> Result<ChangeSummary> {
        let handle = self.handle(plan_id).await?;
        let snapshot = handle.lock().await.clone();
        let changes = self.planner.propose_changes(&snapshot, new_info).await?;
        let removed = removed_task_ids(&changes);

        let mut plan = handle.lock().await;
        let interrupted: Vec<TaskId> = removed
            .into_iter()
            .filter(|id| {
                plan.task(*id)
                    .map(|t| t.status == TaskStatus::InProgress)
                    .unwrap_or(false)
            })
            .collect();

        let mut revised = plan.clone();
        for id in &interrupted {
            revised.fail(*id, "cancelled for replanning")?;
        }
        let summary = revised.apply_changes(&changes)?;

        for id in &interrupted {
            self.runtime.stop_task(plan_id, *id).await;
        }
        *plan = revised;
        self.checkpoints.save(&plan).await?;
        info!(
            plan = %plan_id,
            inserted = summary.inserted.len(),
            removed = summary.removed.len(),
            stopped = interrupted.len(),
            "Plan revised"
        );
        Ok(summary)
    }

    /// Stop a plan's work; `resume` picks it up again
    ///
    /// Sub-agents are cancelled, running tasks go back to pending and tool
    /// connections are closed once nothing else is running.
    pub async fn cancel(&self, plan_id: &PlanId) -> Result<()> {
        let handle = self.handle(plan_id).await?;
        let stopped = {
            let mut plan = handle.lock().await;
            self.runtime.mark_cancelled(plan_id);
            let stopped = self.runtime.stop_plan(plan_id).await;
            plan.reset_interrupted();
            self.checkpoints.save(&plan).await?;
            stopped
        };

        if self.runtime.is_idle() {
            self.runtime.close_connections().await;
        }
        info!(plan = %plan_id, stopped, "Plan cancelled");
        Ok(())
    }

    /// Give up on a plan for good
    pub async fn abandon(&self, plan_id: &PlanId) -> Result<()> {
        self.cancel(plan_id).await?;
        let handle = self.handle(plan_id).await?;
        let mut plan = handle.lock().await;
        plan.abandon();
        self.checkpoints.save(&plan).await?;
        Ok(())
    }

    /// Call any registered tool under the configured tool timeout
    pub async fn invoke_tool(&self, name: &str, args: JsonValue) -> Result<ToolResult> {
        let timeout = Duration::from_secs(self.config.tool_timeout_secs.max(1));
        self.runtime.invoke_tool(name, args, timeout).await
    }

    /// Memory records of `owner` carrying any of `tags`; no tags means all of them
    pub fn query_memory(&self, owner: &str, tags: &[&str]) -> Result<Vec<MemoryRecord>> {
        match &self.memory {
            Some(memory) => memory.load(owner, tags),
            None => Ok(Vec::new()),
        }
    }

    pub fn memory(&self) -> Option<&Arc<MemoryStore>> {
        self.memory.as_ref()
    }

    pub async fn export_config(&self) -> PortableConfig {
        portable::export(&self.runtime).await
    }

    pub async fn import_config(&self, config: &PortableConfig, policy: ImportPolicy) -> Result<ImportReport> {
        portable::import(&self.runtime, config, policy).await
    }

    /// Cancel every plan, stop all sub-agents and close tool connections
    pub async fn shutdown(&self) {
        let plan_ids: Vec<PlanId> = self.plans.iter().map(|e| e.key().clone()).collect();
        for plan_id in &plan_ids {
            if self.runtime.running_tasks(plan_id).is_empty() {
                continue;
            }
            if let Err(e) = self.cancel(plan_id).await {
                warn!(plan = %plan_id, error = %e, "Failed to cancel plan during shutdown");
            }
        }
        let cancelled = self.runtime.agents().cancel_all().await;
        self.runtime.close_connections().await;
        info!(plans = plan_ids.len(), agents = cancelled, "Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::Scripted;
    use quill_core::planner::NewTask;
    use quill_mcp::McpRegistry;

    fn orchestrator(dir: &Path, llm: Arc<Scripted>) -> Orchestrator {
        let store = ContextStore::open(dir.join("ws"), 10_000).unwrap();
        let agents = Arc::new(SubAgentManager::new(store.clone(), Arc::new(LlmSubAgent::new(llm.clone())), 2));
        let runtime = Arc::new(RuntimeRegistry::new(
            ToolManager::new(),
            McpRegistry::default(),
            CapabilityLoader::new(Arc::new(ProcessSandbox::default()), dir.join("skills")),
            agents,
        ));
        Orchestrator::new(
            store,
            llm,
            runtime,
            Some(Arc::new(MemoryStore::in_memory().unwrap())),
            OrchestratorConfig::default(),
            SkillScope::Global,
        )
    }

    async fn seed(orch: &Orchestrator, specs: Vec<NewTask>) -> PlanId {
        let plan = Plan::with_tasks("essay", specs).unwrap();
        orch.checkpoints.save(&plan).await.unwrap();
        plan.id
    }

    #[tokio::test]
    async fn test_next_task_respects_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Scripted::new(&[]));
        let id = seed(&orch, vec![NewTask::new("Outline", ""), NewTask::new("Draft", "").depends_on([1])]).await;

        let first = orch.get_next_task(&id).await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert!(orch.get_next_task(&id).await.unwrap().is_none());

        orch.report_task_result(&id, 1, TaskOutcome::Completed { result_path: None })
            .await
            .unwrap();
        assert_eq!(orch.get_next_task(&id).await.unwrap().unwrap().id, 2);

        let checkpoint = orch.checkpoints.load(&id).await.unwrap();
        assert_eq!(checkpoint.task(2).unwrap().status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_stale_report_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Scripted::new(&[]));
        let id = seed(&orch, vec![NewTask::new("Outline", "")]).await;

        let err = orch
            .report_task_result(&id, 1, TaskOutcome::failed("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_unknown_plan() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Scripted::new(&[]));
        let err = orch.run(&PlanId::new("missing")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_task_blocks_until_retried() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Scripted::new(&["", "second try"]));
        let id = seed(&orch, vec![NewTask::new("Draft", "write it")]).await;

        let report = orch.run(&id).await.unwrap();
        assert_eq!(report.status, RunStatus::Blocked);
        assert_eq!(report.failed.len(), 1);

        orch.retry_task(&id, 1).await.unwrap();
        let report = orch.run(&id).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(orch.query_memory("default", &["plan-summary"]).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_of_a_plan_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Scripted::new(&[]));
        let id = seed(&orch, vec![NewTask::new("Draft", "write it")]).await;

        let live = orch.run_lock(&id).try_lock_owned().unwrap();
        let err = orch.run(&id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(orch.plan(&id).await.unwrap().task(1).unwrap().status, TaskStatus::Pending);

        drop(live);
        assert_eq!(orch.run(&id).await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_query_memory_matches_any_tag() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path(), Scripted::new(&[]));
        let memory = orch.memory().unwrap();
        memory
            .store_glossary_term("ana", "kenning", "compound metaphor", &["poetry"])
            .unwrap();
        memory
            .store_generic("ana", "deadline", &json!("friday"), &["schedule"])
            .unwrap();

        assert_eq!(orch.query_memory("ana", &["poetry", "schedule"]).unwrap().len(), 2);
        assert_eq!(orch.query_memory("ana", &["poetry"]).unwrap().len(), 1);
        assert_eq!(orch.query_memory("ana", &[]).unwrap().len(), 2);
        assert!(orch.query_memory("ana", &["travel"]).unwrap().is_empty());
    }
}

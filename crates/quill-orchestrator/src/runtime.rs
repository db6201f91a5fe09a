//! Runtime registry
//!
//! Everything live that outlasts a single call: the unified tool manager,
//! tool server connections, loaded skills, running task executions and the
//! sub-agents working for them. Owned by the orchestrator and handed to the
//! executor by `Arc`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use quill_core::{CapabilityLoader, PlanId, Result, SubAgentId, SubAgentManager, TaskId, ToolManager, ToolResult};
use quill_mcp::McpRegistry;

type TaskKey = (PlanId, TaskId);

pub struct RuntimeRegistry {
    tools: RwLock<ToolManager>,
    mcp: Mutex<McpRegistry>,
    skills: Mutex<CapabilityLoader>,
    agents: Arc<SubAgentManager>,
    /// Sub-agents spawned for each running task
    task_agents: DashMap<TaskKey, Vec<SubAgentId>>,
    /// Abort handles of running task executions
    running: DashMap<TaskKey, AbortHandle>,
    cancelled: DashSet<PlanId>,
}

impl RuntimeRegistry {
    pub fn new(
        tools: ToolManager,
        mcp: McpRegistry,
        skills: CapabilityLoader,
        agents: Arc<SubAgentManager>,
    ) -> Self {
        Self {
            tools: RwLock::new(tools),
            mcp: Mutex::new(mcp),
            skills: Mutex::new(skills),
            agents,
            task_agents: DashMap::new(),
            running: DashMap::new(),
            cancelled: DashSet::new(),
        }
    }

    pub fn agents(&self) -> &Arc<SubAgentManager> {
        &self.agents
    }

    pub fn tools(&self) -> &RwLock<ToolManager> {
        &self.tools
    }

    pub fn mcp(&self) -> &Mutex<McpRegistry> {
        &self.mcp
    }

    pub fn skills(&self) -> &Mutex<CapabilityLoader> {
        &self.skills
    }

    /// Invoke a tool by name under `timeout`
    ///
    /// The manager lock is released before the call so a slow tool never
    /// holds up registration or other calls.
    pub async fn invoke_tool(&self, name: &str, args: JsonValue, timeout: Duration) -> Result<ToolResult> {
        let tool = self
            .tools
            .read()
            .await
            .get(name)
            .ok_or_else(|| quill_core::Error::NotFound(format!("Unknown tool: {}", name)))?;

        debug!(tool = name, origin = ?tool.origin(), "Invoking tool");
        match tokio::time::timeout(timeout, tool.invoke(args)).await {
            Ok(result) => result,
            Err(_) => Err(quill_core::Error::Timeout(format!(
                "tool {} exceeded {}s",
                name,
                timeout.as_secs()
            ))),
        }
    }

    pub fn track_agent(&self, plan_id: &PlanId, task_id: TaskId, agent: SubAgentId) {
        self.task_agents
            .entry((plan_id.clone(), task_id))
            .or_default()
            .push(agent);
    }

    pub fn track_running(&self, plan_id: &PlanId, task_id: TaskId, handle: AbortHandle) {
        self.running.insert((plan_id.clone(), task_id), handle);
    }

    /// Forget a finished execution and release its sub-agents
    pub fn finish_task(&self, plan_id: &PlanId, task_id: TaskId) {
        let key = (plan_id.clone(), task_id);
        self.running.remove(&key);
        if let Some((_, agents)) = self.task_agents.remove(&key) {
            for agent in agents {
                self.agents.release(&agent);
            }
        }
    }

    /// Stop a running task: cancel its sub-agents, wait for them, then abort the execution
    pub async fn stop_task(&self, plan_id: &PlanId, task_id: TaskId) {
        let key = (plan_id.clone(), task_id);
        let agents = self
            .task_agents
            .remove(&key)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        for agent in &agents {
            if let Err(e) = self.agents.cancel(agent).await {
                debug!(agent = %agent, error = %e, "Sub-agent already gone");
            }
            self.agents.release(agent);
        }
        if let Some((_, handle)) = self.running.remove(&key) {
            handle.abort();
        }
        info!(plan = %plan_id, task = task_id, agents = agents.len(), "Task stopped");
    }

    /// Tasks of a plan that currently have an execution in flight
    pub fn running_tasks(&self, plan_id: &PlanId) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .running
            .iter()
            .filter(|e| &e.key().0 == plan_id)
            .map(|e| e.key().1)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every running task of a plan, returning how many were stopped
    pub async fn stop_plan(&self, plan_id: &PlanId) -> usize {
        let running = self.running_tasks(plan_id);
        for task_id in &running {
            self.stop_task(plan_id, *task_id).await;
        }
        running.len()
    }

    pub fn mark_cancelled(&self, plan_id: &PlanId) {
        self.cancelled.insert(plan_id.clone());
    }

    pub fn clear_cancelled(&self, plan_id: &PlanId) {
        self.cancelled.remove(plan_id);
    }

    pub fn is_cancelled(&self, plan_id: &PlanId) -> bool {
        self.cancelled.contains(plan_id)
    }

    /// Whether any plan still has work in flight
    pub fn is_idle(&self) -> bool {
        self.running.is_empty()
    }

    /// Close tool connections; they reconnect on the next call
    pub async fn close_connections(&self) {
        self.mcp.lock().await.shutdown().await;
    }
}

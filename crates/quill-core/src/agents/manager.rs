//! Sub-Agent Manager
//!
//! Spawns isolated workers, runs them concurrently under a shared permit
//! pool, and hands their results back through the context store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Collected, ScopedContext, SubAgentId, SubAgentState, SubAgentTask, SubAgentType, SubAgentWorker};
use crate::context::{ContextPath, ContextStore};
use crate::planner::TaskId;
use crate::{Error, Result};

/// Default per-worker timeout
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(300);

struct AgentSlot {
    task: SubAgentTask,
    state: watch::Sender<SubAgentState>,
    cancel: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSlot {
    /// Move to `next` unless the agent already reached a terminal state
    fn transition(&self, next: SubAgentState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    fn started(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }
}

/// Owner of every live sub-agent
pub struct SubAgentManager {
    store: ContextStore,
    worker: Arc<dyn SubAgentWorker>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    agents: DashMap<SubAgentId, Arc<AgentSlot>>,
}

impl SubAgentManager {
    pub fn new(store: ContextStore, worker: Arc<dyn SubAgentWorker>, max_concurrency: usize) -> Self {
        Self {
            store,
            worker,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            timeout: DEFAULT_AGENT_TIMEOUT,
            agents: DashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn slot(&self, id: &SubAgentId) -> Result<Arc<AgentSlot>> {
        self.agents
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::NotFound(format!("sub-agent {}", id)))
    }

    /// Create a sub-agent for a plan task
    ///
    /// Every allowed path must already exist. Without an explicit result
    /// path the agent writes to `/agents/<id>/result.md`.
    pub fn spawn(
        &self,
        agent_type: SubAgentType,
        task_id: TaskId,
        description: &str,
        allowed_paths: Vec<ContextPath>,
        result_path: Option<ContextPath>,
    ) -> Result<SubAgentTask> {
        if let Some(missing) = allowed_paths.iter().find(|p| !self.store.exists(p)) {
            return Err(Error::NotFound(format!(
                "context path {} cannot be projected to a sub-agent",
                missing
            )));
        }

        let id = SubAgentId::default();
        let result_path = match result_path {
            Some(path) => path,
            None => ContextPath::parse(&format!("/agents/{}/result.md", id))?,
        };

        let task = SubAgentTask {
            id: id.clone(),
            agent_type,
            task_id,
            description: description.to_string(),
            allowed_paths,
            result_path,
            timeout: self.timeout,
        };

        let (state, _) = watch::channel(SubAgentState::Spawned);
        let (cancel, _) = watch::channel(false);
        self.agents.insert(
            id.clone(),
            Arc::new(AgentSlot {
                task: task.clone(),
                state,
                cancel,
                handle: Mutex::new(None),
            }),
        );

        info!(
            agent = %id,
            kind = %agent_type,
            task = task_id,
            paths = task.allowed_paths.len(),
            "Sub-agent spawned"
        );
        Ok(task)
    }

    /// Start workers in the background; already started or finished agents are skipped
    pub fn launch(&self, ids: &[SubAgentId]) -> Result<()> {
        for id in ids {
            let slot = self.slot(id)?;
            let mut handle = slot.handle.lock().unwrap_or_else(|p| p.into_inner());
            if handle.is_some() || slot.state.borrow().is_terminal() {
                continue;
            }
            *handle = Some(tokio::spawn(run_agent(
                self.store.clone(),
                self.worker.clone(),
                self.permits.clone(),
                slot.clone(),
            )));
        }
        Ok(())
    }

    /// Run the given agents concurrently and wait for all of them
    pub async fn coordinate(&self, ids: &[SubAgentId]) -> Result<Vec<(SubAgentId, Collected)>> {
        self.launch(ids)?;
        let outcomes = join_all(ids.iter().map(|id| self.collect(id, true))).await;

        let mut results = Vec::with_capacity(ids.len());
        for (id, outcome) in ids.iter().zip(outcomes) {
            results.push((id.clone(), outcome?));
        }
        Ok(results)
    }

    /// Result of a sub-agent, read from the context store
    ///
    /// With `wait` the call starts the agent if needed and blocks until it terminates.
    pub async fn collect(&self, id: &SubAgentId, wait: bool) -> Result<Collected> {
        let slot = self.slot(id)?;

        let state = if wait {
            if !slot.started() {
                self.launch(std::slice::from_ref(id))?;
            }
            let mut rx = slot.state.subscribe();
            let state = rx
                .wait_for(|s| s.is_terminal())
                .await
                .map_err(|_| Error::Other(format!("sub-agent {} state channel closed", id)))?
                .clone();
            state
        } else {
            slot.state.borrow().clone()
        };

        match state {
            SubAgentState::Completed { version } => {
                let content = self.store.read(&slot.task.result_path, Some(version)).await?;
                Ok(Collected::Ready(content))
            }
            SubAgentState::Failed { reason } => Ok(Collected::Failed(reason)),
            SubAgentState::Cancelled => Ok(Collected::Failed("cancelled".to_string())),
            SubAgentState::Spawned | SubAgentState::Running => Ok(Collected::Pending),
        }
    }

    /// Stop a sub-agent and wait for it to wind down
    ///
    /// Results it already wrote stay in the store.
    pub async fn cancel(&self, id: &SubAgentId) -> Result<()> {
        let slot = self.slot(id)?;
        slot.cancel.send_replace(true);

        let handle = slot.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        if slot.transition(SubAgentState::Cancelled) {
            info!(agent = %id, "Sub-agent cancelled");
        }
        Ok(())
    }

    /// Cancel every agent that has not finished yet
    pub async fn cancel_all(&self) -> usize {
        let live: Vec<SubAgentId> = self
            .agents
            .iter()
            .filter(|e| !e.value().state.borrow().is_terminal())
            .map(|e| e.key().clone())
            .collect();

        for id in &live {
            if let Err(e) = self.cancel(id).await {
                warn!(agent = %id, error = %e, "Failed to cancel sub-agent");
            }
        }
        live.len()
    }

    /// Cancel all agents working for a plan task
    pub async fn cancel_for_task(&self, task_id: TaskId) -> usize {
        let ids: Vec<SubAgentId> = self
            .agents
            .iter()
            .filter(|e| e.value().task.task_id == task_id && !e.value().state.borrow().is_terminal())
            .map(|e| e.key().clone())
            .collect();
        let mut cancelled = 0;
        for id in &ids {
            match self.cancel(id).await {
                Ok(()) => cancelled += 1,
                Err(e) => debug!(agent = %id, task = task_id, error = %e, "Sub-agent already gone"),
            }
        }
        cancelled
    }

    pub fn state(&self, id: &SubAgentId) -> Option<SubAgentState> {
        self.agents.get(id).map(|s| s.state.borrow().clone())
    }

    pub fn task(&self, id: &SubAgentId) -> Option<SubAgentTask> {
        self.agents.get(id).map(|s| s.task.clone())
    }

    /// Snapshot of every tracked agent
    pub fn list(&self) -> Vec<(SubAgentTask, SubAgentState)> {
        let mut all: Vec<_> = self
            .agents
            .iter()
            .map(|e| (e.value().task.clone(), e.value().state.borrow().clone()))
            .collect();
        all.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        all
    }

    /// Number of agents not yet terminated
    pub fn active_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|e| !e.value().state.borrow().is_terminal())
            .count()
    }

    /// Forget a finished agent
    pub fn release(&self, id: &SubAgentId) -> bool {
        self.agents
            .remove_if(id, |_, slot| slot.state.borrow().is_terminal())
            .is_some()
    }
}

async fn run_agent(
    store: ContextStore,
    worker: Arc<dyn SubAgentWorker>,
    permits: Arc<Semaphore>,
    slot: Arc<AgentSlot>,
) {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            slot.transition(SubAgentState::Failed {
                reason: "sub-agent pool closed".to_string(),
            });
            return;
        }
    };
    if *slot.cancel.borrow() {
        slot.transition(SubAgentState::Cancelled);
        return;
    }

    let task = &slot.task;
    slot.transition(SubAgentState::Running);
    debug!(agent = %task.id, kind = %task.agent_type, "Sub-agent running");

    let ctx = ScopedContext::new(store, task, slot.cancel.subscribe());
    let outcome = tokio::time::timeout(task.timeout, worker.run(task, &ctx)).await;

    let next = match outcome {
        Err(_) => SubAgentState::Failed {
            reason: format!("timed out after {}s", task.timeout.as_secs_f64()),
        },
        Ok(Err(Error::Cancelled(_))) => SubAgentState::Cancelled,
        Ok(Err(e)) => SubAgentState::Failed { reason: e.to_string() },
        Ok(Ok(())) => match ctx.written_version() {
            Some(version) => SubAgentState::Completed { version },
            None => SubAgentState::Failed {
                reason: "worker finished without writing a result".to_string(),
            },
        },
    };

    match &next {
        SubAgentState::Failed { reason } => warn!(agent = %task.id, reason = %reason, "Sub-agent failed"),
        other => debug!(agent = %task.id, state = ?other, "Sub-agent finished"),
    }
    slot.transition(next);
}

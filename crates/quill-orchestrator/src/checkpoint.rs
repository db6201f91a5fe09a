//! Plan checkpoints in the context store
//!
//! Every transition writes a new version of `/todos/plans/<plan_id>.json`,
//! so the latest version is always the state to resume from.

use quill_core::{ContextPath, ContextStore, Plan, PlanId, Result};
use tracing::debug;

pub const PLANS_PREFIX: &str = "/todos/plans";

const WRITER: &str = "orchestrator";

#[derive(Clone)]
pub struct Checkpoints {
    store: ContextStore,
}

impl Checkpoints {
    pub fn new(store: ContextStore) -> Self {
        Self { store }
    }

    pub fn path(plan_id: &PlanId) -> Result<ContextPath> {
        ContextPath::parse(&format!("{}/{}.json", PLANS_PREFIX, plan_id))
    }

    /// Write the plan, returning the checkpoint version
    pub async fn save(&self, plan: &Plan) -> Result<u64> {
        let path = Self::path(&plan.id)?;
        let receipt = self.store.write(&path, &plan.to_json()?, WRITER).await?;
        debug!(plan = %plan.id, version = receipt.version, "Plan checkpointed");
        Ok(receipt.version)
    }

    /// Latest checkpoint of a plan
    pub async fn load(&self, plan_id: &PlanId) -> Result<Plan> {
        let json = self.store.read(&Self::path(plan_id)?, None).await?;
        Plan::from_json(&json)
    }

    pub fn exists(&self, plan_id: &PlanId) -> bool {
        Self::path(plan_id)
            .map(|p| self.store.exists(&p))
            .unwrap_or(false)
    }

    /// Ids of every checkpointed plan
    pub fn list(&self) -> Vec<PlanId> {
        self.store
            .list(PLANS_PREFIX)
            .into_iter()
            .filter_map(|p| {
                p.as_str()
                    .strip_prefix(PLANS_PREFIX)
                    .and_then(|rest| rest.strip_prefix('/'))
                    .and_then(|name| name.strip_suffix(".json"))
                    .map(PlanId::new)
            })
            .collect()
    }
}

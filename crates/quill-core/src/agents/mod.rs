//! Sub-agents
//!
//! ```text
//!   Orchestrator ──spawn──▶ SubAgentManager ──launch──▶ worker (ScopedContext)
//!        ▲                                                  │
//!        └────────── collect ◀── ContextStore ◀── write_result
//! ```
//!
//! A worker sees only the paths it was given at spawn time and hands its
//! result back as a file in the context store. Nothing else crosses the
//! boundary.

pub mod manager;
pub mod scoped;
pub mod types;
pub mod worker;

pub use manager::{DEFAULT_AGENT_TIMEOUT, SubAgentManager};
pub use scoped::ScopedContext;
pub use types::{Collected, SubAgentId, SubAgentState, SubAgentTask, SubAgentType};
pub use worker::{LlmSubAgent, SubAgentWorker};

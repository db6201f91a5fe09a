//! Task planner
//!
//! Plans are dependency graphs of tasks. The graph is checked for cycles on
//! every mutation, and each task walks the state machine
//! pending -> in_progress -> completed | failed, with failed -> pending only
//! on an explicit retry.

pub mod changes;
pub mod decompose;
pub mod graph;
pub mod plan;
pub mod types;

pub use changes::{ChangeSummary, PlanChange, TaskRef, removed_task_ids};
pub use decompose::{TaskPlanner, describe_tasks};
pub use graph::topological_order;
pub use types::{NewTask, Plan, PlanId, PlanProgress, Task, TaskId, TaskKind, TaskPriority, TaskStatus};

//! quill-orchestrator: top-level control loop
//!
//! 計画の作成、タスクの実行（直接実行またはサブエージェント委譲）、
//! チェックポイント、設定のエクスポート／インポートを担当します。

pub mod checkpoint;
pub mod executor;
pub mod orchestrator;
pub mod portable;
pub mod runtime;

pub use checkpoint::{Checkpoints, PLANS_PREFIX};
pub use executor::{TaskExecutor, TaskOutcome, parse_tool_calls};
pub use orchestrator::{Orchestrator, RunReport, RunStatus};
pub use portable::{EXPORT_VERSION, ImportPolicy, ImportReport, PortableConfig, PortableSkill};
pub use runtime::RuntimeRegistry;

//! quill-core: agent-orchestration core for the quill writing assistant
//!
//! タスク計画、バージョン付きコンテキストストア、サブエージェント、
//! 永続メモリ、スキルパッケージのコア機能を提供します。

pub mod agents;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod memory;
pub mod planner;
pub mod retry;
pub mod skills;
pub mod tool;

pub use agents::{Collected, LlmSubAgent, SubAgentId, SubAgentManager, SubAgentTask, SubAgentType, SubAgentWorker};
pub use config::{Config, LlmConfig, LlmProvider, McpConfig, MemoryConfig, OrchestratorConfig, SkillsConfig};
pub use context::{ContextPath, ContextRef, ContextStore, LineEdit};
pub use error::{Error, ErrorCategory, Result};
pub use llm::{Completion, CompletionOptions, LlmClient, SimilaritySearch};
pub use memory::{MemoryKind, MemoryRecord, MemoryStore};
pub use planner::{Plan, PlanId, Task, TaskId, TaskKind, TaskPlanner, TaskStatus};
pub use retry::{CircuitBreaker, CircuitState, RetryPolicy};
pub use skills::{CapabilityLoader, ProcessSandbox, SkillScope};
pub use tool::{InternalTool, Tool, ToolManager, ToolOrigin, ToolResult};

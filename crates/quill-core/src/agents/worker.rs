//! Sub-agent workers

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ScopedContext, SubAgentTask};
use crate::llm::{Completion, CompletionOptions};
use crate::Result;

/// Does the work of one sub-agent
///
/// A worker delivers its outcome only by calling
/// [`ScopedContext::write_result`]; returning `Ok` without writing counts as a
/// failure.
#[async_trait]
pub trait SubAgentWorker: Send + Sync {
    async fn run(&self, task: &SubAgentTask, ctx: &ScopedContext) -> Result<()>;
}

/// Worker that answers with a single completion call
pub struct LlmSubAgent {
    llm: Arc<dyn Completion>,
}

impl LlmSubAgent {
    pub fn new(llm: Arc<dyn Completion>) -> Self {
        Self { llm }
    }

    /// Prompt made of the projected context and the task description
    pub async fn build_prompt(task: &SubAgentTask, ctx: &ScopedContext) -> Result<String> {
        let mut prompt = String::new();
        let paths = ctx.visible_paths();
        if !paths.is_empty() {
            prompt.push_str("## Material\n\n");
            for path in &paths {
                let reference = ctx.reference(path).await?;
                prompt.push_str(&format!("### {}\n{}\n\n", path, reference.render()));
            }
        }
        prompt.push_str("## Task\n\n");
        prompt.push_str(&task.description);
        Ok(prompt)
    }
}

#[async_trait]
impl SubAgentWorker for LlmSubAgent {
    async fn run(&self, task: &SubAgentTask, ctx: &ScopedContext) -> Result<()> {
        let prompt = Self::build_prompt(task, ctx).await?;
        let options = CompletionOptions::with_system(task.agent_type.system_prompt());

        debug!(agent = %task.id, kind = %task.agent_type, "Sub-agent calling model");
        let output = self.llm.complete(&prompt, &options).await?;
        ctx.write_result(&output).await?;
        Ok(())
    }
}

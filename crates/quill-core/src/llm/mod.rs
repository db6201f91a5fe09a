//! LLM collaborators
//!
//! The orchestration code only sees the [`Completion`] and [`SimilaritySearch`]
//! traits. [`LlmClient`] is the HTTP implementation used by the binary.

pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::Result;

pub use client::LlmClient;
pub use types::{CompletionOptions, Message};

/// Black-box text completion
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String>;
}

/// Black-box nearest-neighbour lookup returning record ids, best match first
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn nearest(&self, query: &str, k: usize) -> Result<Vec<String>>;
}

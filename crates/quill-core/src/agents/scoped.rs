//! Projected view of the context store handed to a sub-agent

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tracing::warn;

use super::SubAgentTask;
use crate::context::{ContextPath, ContextRef, ContextStore, WriteReceipt};
use crate::{Error, Result};

/// Read access to an allow-list of paths plus write access to one result path
///
/// Everything a worker learns comes through here, and the only thing it can
/// leave behind is its result file.
pub struct ScopedContext {
    store: ContextStore,
    allowed: BTreeSet<ContextPath>,
    result_path: ContextPath,
    writer: String,
    cancelled: watch::Receiver<bool>,
    /// Version of the last result written, 0 when none
    written: AtomicU64,
}

impl ScopedContext {
    pub(crate) fn new(store: ContextStore, task: &SubAgentTask, cancelled: watch::Receiver<bool>) -> Self {
        Self {
            store,
            allowed: task.allowed_paths.iter().cloned().collect(),
            result_path: task.result_path.clone(),
            writer: format!("agent:{}", task.id),
            cancelled,
            written: AtomicU64::new(0),
        }
    }

    /// Paths this worker can see, sorted
    pub fn visible_paths(&self) -> Vec<ContextPath> {
        self.allowed.iter().cloned().collect()
    }

    pub fn result_path(&self) -> &ContextPath {
        &self.result_path
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    fn check_visible(&self, path: &ContextPath) -> Result<()> {
        if self.allowed.contains(path) {
            Ok(())
        } else {
            warn!(agent = %self.writer, path = %path, "Sub-agent tried to read outside its projection");
            Err(Error::ContextLeak(format!("{} is not in this sub-agent's context", path)))
        }
    }

    /// Latest content of an allowed path
    pub async fn read(&self, path: &ContextPath) -> Result<String> {
        self.check_visible(path)?;
        self.store.read(path, None).await
    }

    /// Prompt-safe reference to an allowed path
    pub async fn reference(&self, path: &ContextPath) -> Result<ContextRef> {
        self.check_visible(path)?;
        self.store.reference(path).await
    }

    /// Write the worker's result as a new version of the result path
    pub async fn write_result(&self, content: &str) -> Result<WriteReceipt> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(format!("{} was cancelled", self.writer)));
        }
        let receipt = self.store.write(&self.result_path, content, &self.writer).await?;
        self.written.store(receipt.version, Ordering::SeqCst);
        Ok(receipt)
    }

    /// Version produced by the last `write_result`, if any
    pub fn written_version(&self) -> Option<u64> {
        match self.written.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }
}

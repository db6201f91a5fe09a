//! File-backed versioned context store
//!
//! Layout under the workspace directory, for the entry `/drafts/ch1.md`:
//!
//! ```text
//! drafts/ch1.md/.v1
//! drafts/ch1.md/.v2
//! drafts/ch1.md/.index.json
//! ```
//!
//! A version becomes visible to readers only once its snapshot file and the
//! updated index are both on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use regex::RegexBuilder;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::edit::apply_edits;
use super::{ContextEntry, ContextPath, ContextRef, GrepMatch, LineEdit, VersionInfo, WriteReceipt};
use crate::{Error, Result};

const INDEX_FILE: &str = ".index.json";

/// Default externalization threshold, in characters
pub const DEFAULT_EXTERNALIZE_THRESHOLD: usize = 10_000;

struct StoreInner {
    root: PathBuf,
    threshold: usize,
    /// Committed version history per path
    index: DashMap<ContextPath, Vec<VersionInfo>>,
    /// Per-path writer queues
    locks: DashMap<ContextPath, Arc<Mutex<()>>>,
}

/// Versioned, path-addressed storage shared by the orchestrator and its sub-agents
#[derive(Clone)]
pub struct ContextStore {
    inner: Arc<StoreInner>,
}

impl ContextStore {
    /// Open (or create) a store rooted at `root`, rebuilding the version index from disk
    pub fn open(root: impl Into<PathBuf>, threshold: usize) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let index = DashMap::new();
        let pattern = format!("{}/**/{}", glob::Pattern::escape(&root.to_string_lossy()), INDEX_FILE);
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("Invalid store root {}: {}", root.display(), e)))?;

        for entry in entries {
            let index_path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable index file");
                    continue;
                }
            };
            match load_index(&root, &index_path) {
                Ok((path, versions)) => {
                    index.insert(path, versions);
                }
                Err(e) => warn!(file = %index_path.display(), error = %e, "Skipping corrupt version index"),
            }
        }

        info!(root = %root.display(), entries = index.len(), "Context store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                threshold: threshold.max(1),
                index,
                locks: DashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn threshold(&self) -> usize {
        self.inner.threshold
    }

    fn entry_dir(&self, path: &ContextPath) -> PathBuf {
        self.inner.root.join(path.to_relative())
    }

    fn snapshot_file(&self, path: &ContextPath, version: u64) -> PathBuf {
        self.entry_dir(path).join(format!(".v{}", version))
    }

    fn path_lock(&self, path: &ContextPath) -> Arc<Mutex<()>> {
        self.inner.locks.entry(path.clone()).or_default().clone()
    }

    /// Whether the path has at least one committed version
    pub fn exists(&self, path: &ContextPath) -> bool {
        self.inner.index.contains_key(path)
    }

    pub fn latest_version(&self, path: &ContextPath) -> Option<u64> {
        self.inner
            .index
            .get(path)
            .and_then(|v| v.last().map(|i| i.version))
    }

    /// Write a new version of `path`
    pub async fn write(&self, path: &ContextPath, content: &str, created_by: &str) -> Result<WriteReceipt> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        self.write_locked(path, content, created_by).await
    }

    /// Caller must hold the path lock
    async fn write_locked(&self, path: &ContextPath, content: &str, created_by: &str) -> Result<WriteReceipt> {
        let mut history = self
            .inner
            .index
            .get(path)
            .map(|v| v.clone())
            .unwrap_or_default();
        let version = history.last().map(|i| i.version).unwrap_or(0) + 1;
        let chars = content.chars().count();

        let dir = self.entry_dir(path);
        fs::create_dir_all(&dir).await?;
        write_atomic(&self.snapshot_file(path, version), content.as_bytes()).await?;

        history.push(VersionInfo {
            version,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            chars,
        });
        write_atomic(&dir.join(INDEX_FILE), &serde_json::to_vec_pretty(&history)?).await?;

        self.inner.index.insert(path.clone(), history);

        let externalized = chars > self.inner.threshold;
        debug!(path = %path, version, chars, externalized, created_by, "Context entry written");

        Ok(WriteReceipt {
            path: path.clone(),
            version,
            externalized,
            chars,
        })
    }

    /// Read the latest version, or a specific one
    pub async fn read(&self, path: &ContextPath, version: Option<u64>) -> Result<String> {
        Ok(self.read_entry(path, version).await?.content)
    }

    /// Read a version together with its metadata
    pub async fn read_entry(&self, path: &ContextPath, version: Option<u64>) -> Result<ContextEntry> {
        let info = {
            let history = self
                .inner
                .index
                .get(path)
                .ok_or_else(|| Error::NotFound(format!("context path {}", path)))?;
            let found = match version {
                None => history.last(),
                Some(v) => history.iter().find(|i| i.version == v),
            };
            found.cloned().ok_or_else(|| {
                Error::NotFound(format!("version {:?} of {}", version, path))
            })?
        };

        let content = fs::read_to_string(self.snapshot_file(path, info.version)).await?;
        Ok(ContextEntry {
            path: path.clone(),
            content,
            version: info.version,
            created_by: info.created_by,
            created_at: info.created_at,
        })
    }

    /// Apply a batch of line edits as one new version; nothing is written if any edit is invalid
    pub async fn edit(&self, path: &ContextPath, edits: &[LineEdit], created_by: &str) -> Result<u64> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        let current = self.read(path, None).await?;
        let updated = apply_edits(&current, edits)?;
        let receipt = self.write_locked(path, &updated, created_by).await?;
        info!(path = %path, version = receipt.version, edits = edits.len(), "Batch edit applied");
        Ok(receipt.version)
    }

    /// Write the content of an old version back as the newest version
    pub async fn restore(&self, path: &ContextPath, version: u64, created_by: &str) -> Result<WriteReceipt> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        let old = self.read(path, Some(version)).await?;
        self.write_locked(path, &old, created_by).await
    }

    /// Paths under `prefix`, sorted
    pub fn list(&self, prefix: &str) -> Vec<ContextPath> {
        let mut paths: Vec<ContextPath> = self
            .inner
            .index
            .iter()
            .filter(|e| e.key().is_under(prefix))
            .map(|e| e.key().clone())
            .collect();
        paths.sort();
        paths
    }

    /// Case-insensitive regex search over the latest version of every path under `prefix`
    pub async fn grep(&self, pattern: &str, prefix: &str) -> Result<Vec<GrepMatch>> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::InvalidInput(format!("invalid pattern {:?}: {}", pattern, e)))?;

        let mut matches = Vec::new();
        for path in self.list(prefix) {
            let content = match self.read(&path, None).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping unreadable entry during grep");
                    continue;
                }
            };
            for (i, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(GrepMatch {
                        path: path.clone(),
                        line: i + 1,
                        text: line.to_string(),
                    });
                }
            }
        }
        Ok(matches)
    }

    /// Version history, oldest first
    pub fn versions(&self, path: &ContextPath) -> Result<Vec<VersionInfo>> {
        self.inner
            .index
            .get(path)
            .map(|v| v.clone())
            .ok_or_else(|| Error::NotFound(format!("context path {}", path)))
    }

    /// Turn content headed for a prompt into a prompt-safe reference
    ///
    /// Content within the threshold is returned inline. Larger content is
    /// written to `path` and only a reference is returned.
    pub async fn prepare_for_prompt(
        &self,
        path: &ContextPath,
        content: &str,
        created_by: &str,
    ) -> Result<ContextRef> {
        let chars = content.chars().count();
        if chars <= self.inner.threshold {
            return Ok(ContextRef::Inline {
                content: content.to_string(),
            });
        }
        let receipt = self.write(path, content, created_by).await?;
        Ok(ContextRef::External {
            path: receipt.path,
            version: receipt.version,
            chars,
        })
    }

    /// Prompt-safe reference to the latest version of an existing entry
    pub async fn reference(&self, path: &ContextPath) -> Result<ContextRef> {
        let entry = self.read_entry(path, None).await?;
        let chars = entry.content.chars().count();
        if chars <= self.inner.threshold {
            Ok(ContextRef::Inline {
                content: entry.content,
            })
        } else {
            Ok(ContextRef::External {
                path: entry.path,
                version: entry.version,
                chars,
            })
        }
    }
}

fn load_index(root: &Path, index_path: &Path) -> Result<(ContextPath, Vec<VersionInfo>)> {
    let dir = index_path
        .parent()
        .ok_or_else(|| Error::Other(format!("index without parent: {}", index_path.display())))?;
    let relative = dir
        .strip_prefix(root)
        .map_err(|e| Error::Other(format!("index outside root: {}", e)))?;
    let raw: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let path = ContextPath::parse(&raw.join("/"))?;

    let bytes = std::fs::read(index_path)?;
    let mut versions: Vec<VersionInfo> = serde_json::from_slice(&bytes)?;
    versions.sort_by_key(|v| v.version);
    if versions.is_empty() {
        return Err(Error::Other(format!("empty version index for {}", path)));
    }
    Ok((path, versions))
}

async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, target).await?;
    Ok(())
}

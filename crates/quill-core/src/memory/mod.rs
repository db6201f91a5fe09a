//! Persistent memory
//!
//! Style profiles, glossary terms and other cross-session facts, keyed by
//! owner and retrievable by tag or similarity.

pub mod store;
pub mod types;

pub use store::MemoryStore;
pub use types::{MemoryKind, MemoryRecord, StyleProfile};

//! Versioned context store
//!
//! The externalization mechanism for anything too large to inline into a
//! prompt, and the only channel sub-agents use to hand results back.

pub mod edit;
pub mod path;
pub mod store;
pub mod types;

pub use edit::apply_edits;
pub use path::ContextPath;
pub use store::{ContextStore, DEFAULT_EXTERNALIZE_THRESHOLD};
pub use types::{ContextEntry, ContextRef, GrepMatch, LineEdit, VersionInfo, WriteReceipt};

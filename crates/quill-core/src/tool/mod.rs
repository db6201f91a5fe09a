//! Tool system
//!
//! Built-in tools, tool-server tools and skill tools all end up as
//! [`InternalTool`]s inside one [`ToolManager`].

pub mod internal;
pub mod manager;
pub mod traits;

pub use internal::{InternalTool, ToolOrigin};
pub use manager::{ToolDefinition, ToolManager};
pub use traits::{Tool, ToolResult};

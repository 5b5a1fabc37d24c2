//! Tool system: the `Tool` trait, the per-session registry, and MCP clients.
//!
//! Internal tool functions and external MCP server tools share one
//! interface; the LLM only ever sees fully qualified names
//! (`category__function` / `server__tool`).

pub mod builtin;
pub mod mcp;
pub mod registry;
pub mod tool;

pub use registry::{build_active_tools, ActiveTools, ToolHost};
pub use tool::{Tool, ToolDefinition, ToolResult};

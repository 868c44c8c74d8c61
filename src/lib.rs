//! Flint Hub - an automation hub speaking MCP over HTTP + SSE
//!
//! The hub exposes a dynamically composed set of tools to a remote MCP
//! client: built-in `device.*` tools, plus tools discovered at runtime from
//! installed apps that ship a capability provider.

pub mod apps;
pub mod config;
pub mod device;
pub mod discovery;
pub mod mcp;
pub mod provider;
pub mod registry;
pub mod server;
pub mod tool;
pub mod watcher;

pub use registry::{RegistryEvent, ToolRegistry};
pub use tool::{SharedTool, Tool, ToolContent, ToolResult};

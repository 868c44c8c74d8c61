//! Model Context Protocol over JSON-RPC 2.0.

pub mod jsonrpc;
pub mod protocol;

pub use jsonrpc::{Notification, Request, Response, RpcError};
pub use protocol::{McpProtocol, MCP_PROTOCOL_VERSION, SERVER_NAME, TOOLS_LIST_CHANGED};

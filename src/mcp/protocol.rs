//! MCP method dispatch.
//!
//! [`McpProtocol`] turns one decoded JSON-RPC message into at most one
//! response and, independently, relays registry changes as
//! `notifications/tools/list_changed` on a broadcast stream.

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::jsonrpc::{Notification, Request, Response, RpcError};
use crate::registry::{RegistryEvent, ToolRegistry};
use crate::tool::{JsonObject, ToolResult};

pub const MCP_PROTOCOL_VERSION: &str = "2025-11-25";
pub const SERVER_NAME: &str = "flint-hub";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

const NOTIFICATION_CAPACITY: usize = 64;

const INSTRUCTIONS: &str = "Flint Hub controls a device. Follow these rules:\n\
1. Use device.get_tree FIRST to understand screen content and find elements. It is fast and returns structured data.\n\
2. Use device.screenshot ONLY when you need visual verification (images, colors, layout). It is slow.\n\
3. For apps with their own tools (prefixed with the app name), prefer app-specific tools (read_screen, get_screen) over device-level tools.\n\
4. Use element bounds from device.get_tree for tap coordinates. Never guess from screenshots.\n\
5. For scrolling large distances, use device.swipe instead of device.scroll (scroll moves very little).";

pub struct McpProtocol {
    registry: ToolRegistry,
    notifications: broadcast::Sender<Value>,
    relay: JoinHandle<()>,
}

impl McpProtocol {
    /// Must be called inside a Tokio runtime: the registry relay runs as a
    /// task for as long as the protocol lives.
    pub fn new(registry: ToolRegistry) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let events = registry.subscribe();
        let relay = tokio::spawn(relay_changes(events, notifications.clone()));
        Self {
            registry,
            notifications,
            relay,
        }
    }

    /// Outbound notifications. Slow receivers lose the oldest entries.
    pub fn notifications(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }

    /// Handle one message. Returns `None` when nothing should be sent back.
    pub async fn handle_message(&self, message: Value) -> Option<Value> {
        let request: Request = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                warn!("invalid JSON-RPC envelope: {e}");
                return Some(encode(Response::err(
                    RpcError::invalid_request(format!("Invalid Request: {e}")),
                    Value::Null,
                )));
            }
        };
        self.dispatch(request).await.map(encode)
    }

    async fn dispatch(&self, request: Request) -> Option<Response> {
        let id = request.response_id();
        debug!(method = ?request.method, %id, "received");

        let Some(method) = request.method.as_deref() else {
            return Some(Response::err(
                RpcError::invalid_request("Invalid Request: missing method"),
                id,
            ));
        };

        match method {
            "initialize" => Some(self.initialize(&request, id)),
            "notifications/initialized" => {
                info!("client initialized");
                None
            }
            "tools/list" => Some(self.tools_list(id)),
            "tools/call" => Some(self.tools_call(request.params.as_ref(), id).await),
            "ping" => Some(Response::new(json!({}), id)),
            other if request.is_notification() && other.starts_with("notifications/") => {
                debug!(method = other, "ignoring client notification");
                None
            }
            other => {
                warn!(method = other, "unknown method");
                Some(Response::err(RpcError::method_not_found(other), id))
            }
        }
    }

    fn initialize(&self, request: &Request, id: Value) -> Response {
        let client = request
            .params
            .as_ref()
            .and_then(|p| p.get("clientInfo"))
            .cloned()
            .unwrap_or(Value::Null);
        info!(%client, "initialize");

        Response::new(
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": SERVER_NAME, "version": SERVER_VERSION},
                "instructions": INSTRUCTIONS,
            }),
            id,
        )
    }

    fn tools_list(&self, id: Value) -> Response {
        let tools: Vec<Value> = self
            .registry
            .list()
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect();
        debug!(count = tools.len(), "tools/list");
        Response::new(json!({ "tools": tools }), id)
    }

    async fn tools_call(&self, params: Option<&Value>, id: Value) -> Response {
        let Some(name) = params.and_then(|p| p.get("name")).and_then(Value::as_str) else {
            return Response::err(
                RpcError::invalid_params("Missing required parameter: name"),
                id,
            );
        };

        let arguments = match params.and_then(|p| p.get("arguments")) {
            None | Some(Value::Null) => JsonObject::new(),
            Some(Value::Object(args)) => args.clone(),
            Some(_) => {
                return Response::err(
                    RpcError::invalid_params("Invalid parameter: arguments must be an object"),
                    id,
                )
            }
        };

        let Some(tool) = self.registry.get(name) else {
            warn!(tool = name, "tool not found");
            return Response::err(RpcError::unknown_tool(name), id);
        };

        info!(tool = name, "calling tool");
        let result = match tool.execute(arguments).await {
            Ok(result) => result,
            Err(e) => {
                error!(tool = name, "tool execution failed: {e:#}");
                ToolResult::error(format!("Error: {e}"))
            }
        };

        match serde_json::to_value(&result) {
            Ok(value) => Response::new(value, id),
            Err(e) => Response::err(RpcError::internal(e.to_string()), id),
        }
    }
}

impl Drop for McpProtocol {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

fn encode(response: Response) -> Value {
    serde_json::to_value(response).unwrap_or_else(|e| {
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": RpcError::INTERNAL_ERROR, "message": e.to_string()},
        })
    })
}

async fn relay_changes(
    mut events: broadcast::Receiver<RegistryEvent>,
    notifications: broadcast::Sender<Value>,
) {
    let list_changed = json!(Notification::new(TOOLS_LIST_CHANGED));
    loop {
        match events.recv().await {
            Ok(event) => debug!(?event, "registry changed"),
            // Missed events still mean the list changed.
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
        let _ = notifications.send(list_changed.clone());
    }
}

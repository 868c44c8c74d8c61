//! Tools that forward to a discovered app's provider.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use super::schema::ToolDefinition;
use crate::provider::{
    display_value, reply_str, verbs, Extras, ProviderError, ProviderTransport, ERROR_KEY,
};
use crate::tool::{empty_schema, JsonObject, Tool, ToolResult};

/// How screen verification polls after a navigating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(2000),
        }
    }
}

/// The provider behind one discovered app, shared by all of its tools.
pub struct AppEndpoint {
    transport: Arc<dyn ProviderTransport>,
    authority: String,
    label: String,
}

impl AppEndpoint {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        authority: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            authority: authority.into(),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    async fn call(&self, verb: &str, extras: Extras) -> Result<Extras, ProviderError> {
        debug!(authority = %self.authority, verb, "provider call");
        self.transport.call(&self.authority, verb, extras).await
    }

    /// Poll `get_screen` until it reports `expected` or the policy's timeout
    /// elapses. Poll failures are ignored; the app may be mid-navigation.
    pub async fn verify_screen(&self, expected: &str, policy: VerifyPolicy) -> String {
        let deadline = Instant::now() + policy.timeout;
        while Instant::now() < deadline {
            let poll = self.call(verbs::GET_SCREEN, Extras::new());
            if let Ok(Ok(reply)) = tokio::time::timeout_at(deadline, poll).await {
                if reply_str(&reply, "screen") == Some(expected) {
                    return format!("Screen verified: {expected}");
                }
            }
            tokio::time::sleep_until((Instant::now() + policy.interval).min(deadline)).await;
        }
        format!("Screen verification timed out (expected: {expected})")
    }

    fn failure(&self, tool: &str, err: &ProviderError) -> ToolResult {
        error!(tool, authority = %self.authority, "provider call failed: {err}");
        match err {
            ProviderError::PermissionDenied(msg) => {
                ToolResult::error(format!("Error: Permission denied - {msg}"))
            }
            other => ToolResult::error(format!("Error: {other}")),
        }
    }
}

/// Reply-side `_error`, if the provider reported one.
fn reported_error(reply: &Extras) -> Option<ToolResult> {
    reply
        .get(ERROR_KEY)
        .filter(|v| !v.is_null())
        .map(|v| ToolResult::error(format!("Error: {}", display_value(v))))
}

/// Text form of a scalar parameter. Objects, arrays and null are not
/// forwarded.
fn scalar_param(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// An app-declared tool, routed to the provider's `call_tool` verb.
pub struct RemoteTool {
    endpoint: Arc<AppEndpoint>,
    definition: ToolDefinition,
    name: String,
    description: String,
    verify: VerifyPolicy,
}

impl RemoteTool {
    pub fn new(
        endpoint: Arc<AppEndpoint>,
        prefix: &str,
        definition: ToolDefinition,
        verify: VerifyPolicy,
    ) -> Self {
        Self {
            name: format!("{prefix}.{}", definition.name),
            description: format!("[{}] {}", endpoint.label(), definition.description),
            endpoint,
            definition,
            verify,
        }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &Value {
        &self.definition.input_schema
    }

    async fn execute(&self, params: JsonObject) -> anyhow::Result<ToolResult> {
        let mut extras = Extras::new();
        extras.insert("_tool".to_string(), json!(self.definition.name));
        for (key, value) in &params {
            if let Some(text) = scalar_param(value) {
                extras.insert(key.clone(), Value::String(text));
            }
        }

        let reply = match self.endpoint.call(verbs::CALL_TOOL, extras).await {
            Ok(reply) => reply,
            Err(e) => return Ok(self.endpoint.failure(&self.name, &e)),
        };
        if let Some(failed) = reported_error(&reply) {
            return Ok(failed);
        }

        let mut text = format!(
            "Tool '{}' executed successfully on {}.",
            self.definition.name,
            self.endpoint.label()
        );
        for (key, value) in reply.iter().filter(|(k, _)| !k.starts_with('_')) {
            text.push_str(&format!("\n{key}: {}", display_value(value)));
        }

        let target = Some(self.definition.target.as_str())
            .filter(|t| !t.is_empty())
            .or_else(|| reply_str(&reply, "_target").filter(|t| !t.is_empty()));
        if let Some(target) = target {
            let verified = self.endpoint.verify_screen(target, self.verify).await;
            text.push_str(&format!("\nTarget screen: {target}\n{verified}"));
        }

        Ok(ToolResult::text(text))
    }
}

/// `{prefix}.read_screen`: structured snapshot of the app's current screen.
pub struct ReadScreenTool {
    endpoint: Arc<AppEndpoint>,
    name: String,
    description: String,
    schema: Value,
}

impl ReadScreenTool {
    pub fn new(endpoint: Arc<AppEndpoint>, prefix: &str) -> Self {
        Self {
            name: format!("{prefix}.read_screen"),
            description: format!(
                "[{}] Read the current screen content as structured data. \
                 PREFERRED way to understand what's on screen - faster and more precise than device.screenshot.",
                endpoint.label()
            ),
            endpoint,
            schema: empty_schema(),
        }
    }
}

#[async_trait]
impl Tool for ReadScreenTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &Value {
        &self.schema
    }

    async fn execute(&self, _params: JsonObject) -> anyhow::Result<ToolResult> {
        let reply = match self.endpoint.call(verbs::READ_SCREEN, Extras::new()).await {
            Ok(reply) => reply,
            Err(e) => return Ok(self.endpoint.failure(&self.name, &e)),
        };
        if let Some(failed) = reported_error(&reply) {
            return Ok(failed);
        }
        let snapshot = match reply.get("snapshot") {
            Some(Value::Null) | None => "No snapshot data".to_string(),
            Some(value) => display_value(value),
        };
        Ok(ToolResult::text(snapshot))
    }
}

/// `{prefix}.get_screen`: name of the app's current screen.
pub struct GetScreenTool {
    endpoint: Arc<AppEndpoint>,
    name: String,
    description: String,
    schema: Value,
}

impl GetScreenTool {
    pub fn new(endpoint: Arc<AppEndpoint>, prefix: &str) -> Self {
        Self {
            name: format!("{prefix}.get_screen"),
            description: format!("[{}] Get the current screen name", endpoint.label()),
            endpoint,
            schema: empty_schema(),
        }
    }
}

#[async_trait]
impl Tool for GetScreenTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &Value {
        &self.schema
    }

    async fn execute(&self, _params: JsonObject) -> anyhow::Result<ToolResult> {
        let reply = match self.endpoint.call(verbs::GET_SCREEN, Extras::new()).await {
            Ok(reply) => reply,
            Err(e) => return Ok(self.endpoint.failure(&self.name, &e)),
        };
        if let Some(failed) = reported_error(&reply) {
            return Ok(failed);
        }
        let screen = reply_str(&reply, "screen").unwrap_or_default();
        Ok(ToolResult::text(format!("Current screen: {screen}")))
    }
}

/// `{prefix}.action`: invoke a named semantic action, optionally scoped to
/// an item of a list.
pub struct ActionTool {
    endpoint: Arc<AppEndpoint>,
    name: String,
    description: String,
    schema: Value,
}

impl ActionTool {
    pub fn new(endpoint: Arc<AppEndpoint>, prefix: &str) -> Self {
        Self {
            name: format!("{prefix}.action"),
            description: format!(
                "[{}] Invoke a semantic action (tap button, select item, etc.)",
                endpoint.label()
            ),
            endpoint,
            schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "description": "The action name to invoke"},
                    "list": {"type": "string", "description": "Optional list ID for list item actions"},
                    "index": {"type": "integer", "description": "Optional item index for list item actions"}
                },
                "required": ["action"]
            }),
        }
    }
}

#[async_trait]
impl Tool for ActionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &Value {
        &self.schema
    }

    async fn execute(&self, params: JsonObject) -> anyhow::Result<ToolResult> {
        let action = params.get("action").and_then(scalar_param).unwrap_or_default();
        if action.trim().is_empty() {
            return Ok(ToolResult::error("Error: 'action' parameter is required"));
        }

        let mut extras = Extras::new();
        extras.insert("_action".to_string(), json!(action));
        if let Some(list) = params.get("list").and_then(scalar_param) {
            extras.insert("_list_id".to_string(), json!(list));
        }
        let index = params.get("index").and_then(|v| match v {
            Value::String(s) => s.trim().parse::<i64>().ok(),
            other => other.as_i64(),
        });
        if let Some(index) = index {
            extras.insert("_item_index".to_string(), json!(index));
        }

        let reply = match self.endpoint.call(verbs::INVOKE_ACTION, extras).await {
            Ok(reply) => reply,
            Err(e) => return Ok(self.endpoint.failure(&self.name, &e)),
        };
        if let Some(failed) = reported_error(&reply) {
            return Ok(failed);
        }

        let label = self.endpoint.label();
        if reply.get("success").and_then(Value::as_bool).unwrap_or(false) {
            Ok(ToolResult::text(format!(
                "Action '{action}' invoked successfully on {label}"
            )))
        } else {
            Ok(ToolResult::error(format!("Action '{action}' failed on {label}")))
        }
    }
}

//! Tool abstraction shared by device tools and discovered-app tools.
//!
//! A tool is a named, schema-described capability. Tools are immutable once
//! constructed; the registry hands out `Arc<dyn Tool>` so an in-flight call
//! keeps its tool alive even if a rescan removes it from the registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Parameter map passed to [`Tool::execute`].
pub type JsonObject = Map<String, Value>;

/// Shared handle to a tool implementation.
pub type SharedTool = Arc<dyn Tool>;

/// A single content item of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    /// Plain text
    Text { text: String },
    /// Base64-encoded image
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Text payload, if this is a text item.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Image { .. } => None,
        }
    }
}

/// Outcome of one tool invocation. Built fresh per call, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "is_false")]
    pub is_error: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ToolResult {
    /// Successful result carrying a single text item.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
        }
    }

    /// Failed result carrying a single text item.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: true,
        }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::image(data, mime_type)],
            is_error: false,
        }
    }

    /// All text items joined by newlines. Handy for logs and tests.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(ToolContent::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An invokable capability exposed to MCP clients.
///
/// `execute` returning `Err` is treated as an unexpected failure: the
/// protocol layer converts it into an `isError` result rather than a
/// JSON-RPC error, because the request itself was well formed.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Globally unique dotted name, e.g. `device.tap`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-Schema-like description of accepted parameters.
    fn input_schema(&self) -> &Value;

    async fn execute(&self, params: JsonObject) -> anyhow::Result<ToolResult>;
}

/// Empty-object input schema used by parameterless tools.
pub fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Builds an object schema from `(name, type, description)` triples.
pub fn object_schema(properties: &[(&str, &str, &str)], required: &[&str]) -> Value {
    let props: JsonObject = properties
        .iter()
        .map(|(name, ty, description)| {
            (
                (*name).to_string(),
                json!({"type": ty, "description": description}),
            )
        })
        .collect();
    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

//! Discovered apps and their capability schemas.
//!
//! The schema is an external, partially-trusted contract, so parsing is
//! lenient: unknown fields are ignored, optional fields fall back to
//! defaults and a bad tool entry only drops that entry.

use serde_json::{Map, Value};
use tracing::warn;

/// Protocol name assumed when a schema does not declare one.
pub const DEFAULT_PROTOCOL: &str = "flint";

/// Schema version assumed when a schema does not declare one.
pub const DEFAULT_VERSION: &str = "1.0";

/// One external capability provider found by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredApp {
    pub package: String,
    pub label: String,
    pub authority: String,
    pub schema: AppSchema,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppSchema {
    pub protocol: String,
    pub version: String,
    pub name: String,
    pub tools: Vec<ToolDefinition>,
    pub screens: Vec<String>,
}

/// Declarative form of a tool before translation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// Screen the tool navigates to; empty when none is declared.
    pub target: String,
    pub input_schema: Value,
}

/// Parse a schema document. Returns `None` when the document is not a JSON
/// object or its `tools`/`screens` fields are not arrays.
pub fn parse_schema(raw: &str) -> Option<AppSchema> {
    let root = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(root)) => root,
        Ok(_) => {
            warn!("schema root is not an object");
            return None;
        }
        Err(e) => {
            warn!("schema parse error: {e}");
            return None;
        }
    };

    let tools = match root.get("tools") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter_map(parse_tool).collect(),
        Some(_) => {
            warn!("schema `tools` is not an array");
            return None;
        }
    };

    let screens = match root.get("screens") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
        Some(_) => {
            warn!("schema `screens` is not an array");
            return None;
        }
    };

    Some(AppSchema {
        protocol: text_field(&root, "protocol").unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
        version: text_field(&root, "version").unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        name: text_field(&root, "name").unwrap_or_default(),
        tools,
        screens,
    })
}

fn parse_tool(entry: &Value) -> Option<ToolDefinition> {
    let Some(obj) = entry.as_object() else {
        warn!("dropping tool definition that is not an object");
        return None;
    };
    // A tool without a name cannot be addressed; drop just this entry.
    let name = text_field(obj, "name").filter(|n| !n.is_empty())?;
    let input_schema = match obj.get("inputSchema") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(schema @ Value::Object(_)) => schema.clone(),
        Some(_) => {
            warn!(tool = %name, "dropping tool definition with non-object inputSchema");
            return None;
        }
    };
    Some(ToolDefinition {
        description: text_field(obj, "description").unwrap_or_default(),
        target: text_field(obj, "target").unwrap_or_default(),
        input_schema,
        name,
    })
}

/// Text content of a scalar field. Numbers and booleans are accepted in
/// their JSON spelling; objects, arrays and null count as absent.
fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

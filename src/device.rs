//! Built-in `device.*` tools.
//!
//! The tools themselves only validate parameters and format results; the
//! actual screen access and gesture injection live behind [`DeviceBridge`],
//! which the embedding platform provides. A bridge that is not connected
//! turns every device tool into a "service unavailable" error result.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::registry::ToolRegistry;
use crate::tool::{object_schema, JsonObject, Tool, ToolResult};

pub const SERVICE_UNAVAILABLE: &str =
    "Device service not connected. Enable the accessibility bridge and try again.";

const DEFAULT_SWIPE_MS: u64 = 300;

/// Platform access used by the device tools.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Accessibility tree of the current screen as JSON. A tree carrying an
    /// `error` key is reported to the client as a failed result.
    async fn screen_tree(&self, include_off_screen: bool) -> anyhow::Result<Value>;

    /// PNG-encoded screenshot.
    async fn screenshot(&self) -> anyhow::Result<Vec<u8>>;

    async fn tap(&self, x: f64, y: f64) -> anyhow::Result<bool>;

    async fn long_press(&self, x: f64, y: f64) -> anyhow::Result<bool>;

    async fn swipe(&self, from: (f64, f64), to: (f64, f64), duration: Duration)
        -> anyhow::Result<bool>;

    async fn type_text(&self, text: &str) -> anyhow::Result<bool>;

    async fn press_key(&self, key: &str) -> anyhow::Result<bool>;

    async fn scroll(&self, direction: &str) -> anyhow::Result<bool>;
}

/// Bridge for hosts without device access. Never connected.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedBridge;

#[async_trait]
impl DeviceBridge for DisconnectedBridge {
    fn is_connected(&self) -> bool {
        false
    }

    async fn screen_tree(&self, _include_off_screen: bool) -> anyhow::Result<Value> {
        anyhow::bail!(SERVICE_UNAVAILABLE)
    }

    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!(SERVICE_UNAVAILABLE)
    }

    async fn tap(&self, _x: f64, _y: f64) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn long_press(&self, _x: f64, _y: f64) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn swipe(
        &self,
        _from: (f64, f64),
        _to: (f64, f64),
        _duration: Duration,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn type_text(&self, _text: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn press_key(&self, _key: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn scroll(&self, _direction: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceAction {
    GetTree,
    Screenshot,
    Tap,
    LongPress,
    Swipe,
    Type,
    PressKey,
    Scroll,
}

pub struct DeviceTool {
    action: DeviceAction,
    name: &'static str,
    description: &'static str,
    schema: Value,
    bridge: Arc<dyn DeviceBridge>,
}

/// Every device tool, bound to `bridge`.
pub fn device_tools(bridge: Arc<dyn DeviceBridge>) -> Vec<DeviceTool> {
    let coordinates = object_schema(
        &[
            ("x", "number", "X coordinate in screen pixels"),
            ("y", "number", "Y coordinate in screen pixels"),
        ],
        &["x", "y"],
    );
    let tool = |action, name, description, schema| DeviceTool {
        action,
        name,
        description,
        schema,
        bridge: bridge.clone(),
    };

    vec![
        tool(
            DeviceAction::GetTree,
            "device.get_tree",
            "Get the current screen's accessibility tree as JSON with UI elements, their properties and bounds. \
             PREFERRED over device.screenshot for understanding screen content. \
             Off-screen nodes are excluded unless includeOffScreen is true.",
            json!({
                "type": "object",
                "properties": {
                    "includeOffScreen": {
                        "type": "boolean",
                        "description": "Include off-screen nodes in the tree (default false)"
                    }
                }
            }),
        ),
        tool(
            DeviceAction::Screenshot,
            "device.screenshot",
            "Capture the current screen as a PNG image. SLOW: prefer device.get_tree for reading \
             screen content and use screenshots only for visual verification.",
            json!({"type": "object", "properties": {}}),
        ),
        tool(
            DeviceAction::Tap,
            "device.tap",
            "Perform a tap at the given screen coordinates",
            coordinates.clone(),
        ),
        tool(
            DeviceAction::LongPress,
            "device.long_press",
            "Perform a long press at the given screen coordinates",
            coordinates,
        ),
        tool(
            DeviceAction::Swipe,
            "device.swipe",
            "Perform a swipe gesture from one point to another",
            object_schema(
                &[
                    ("start_x", "number", "Start X coordinate in screen pixels"),
                    ("start_y", "number", "Start Y coordinate in screen pixels"),
                    ("end_x", "number", "End X coordinate in screen pixels"),
                    ("end_y", "number", "End Y coordinate in screen pixels"),
                    ("duration_ms", "number", "Duration of the swipe in milliseconds (default 300)"),
                ],
                &["start_x", "start_y", "end_x", "end_y"],
            ),
        ),
        tool(
            DeviceAction::Type,
            "device.type",
            "Type text into the currently focused input field",
            object_schema(
                &[("text", "string", "The text to type into the focused field")],
                &["text"],
            ),
        ),
        tool(
            DeviceAction::PressKey,
            "device.press_key",
            "Simulate a global key press (back, home, recents, notifications, quick_settings, power_dialog)",
            json!({
                "type": "object",
                "properties": {
                    "key": {
                        "type": "string",
                        "description": "Key to press",
                        "enum": ["back", "home", "recents", "notifications", "quick_settings", "power_dialog"]
                    }
                },
                "required": ["key"]
            }),
        ),
        tool(
            DeviceAction::Scroll,
            "device.scroll",
            "Scroll the screen in the given direction (up, down, left, right)",
            json!({
                "type": "object",
                "properties": {
                    "direction": {
                        "type": "string",
                        "description": "Scroll direction",
                        "enum": ["up", "down", "left", "right"]
                    }
                },
                "required": ["direction"]
            }),
        ),
    ]
}

/// Register every device tool in `registry`.
pub fn register_device_tools(registry: &ToolRegistry, bridge: Arc<dyn DeviceBridge>) {
    for tool in device_tools(bridge) {
        registry.register(Arc::new(tool));
    }
}

fn number(params: &JsonObject, key: &str) -> Result<f64, ToolResult> {
    let value = params.get(key).and_then(|v| match v {
        Value::String(s) => s.trim().parse().ok(),
        other => other.as_f64(),
    });
    value.ok_or_else(|| ToolResult::error(format!("Missing required parameter: {key}")))
}

fn string<'a>(params: &'a JsonObject, key: &str) -> Result<&'a str, ToolResult> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolResult::error(format!("Missing required parameter: {key}")))
}

fn outcome(success: bool, ok: String, failed: String) -> ToolResult {
    if success {
        ToolResult::text(ok)
    } else {
        ToolResult::error(failed)
    }
}

impl DeviceTool {
    async fn run(&self, params: &JsonObject) -> anyhow::Result<Result<ToolResult, ToolResult>> {
        let bridge = &self.bridge;
        let result = match self.action {
            DeviceAction::GetTree => {
                let include = params
                    .get("includeOffScreen")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let tree = bridge.screen_tree(include).await?;
                let failed = tree.get("error").is_some();
                let result = ToolResult::text(tree.to_string());
                ToolResult {
                    is_error: failed,
                    ..result
                }
            }
            DeviceAction::Screenshot => match bridge.screenshot().await {
                Ok(png) => ToolResult::image(
                    base64::engine::general_purpose::STANDARD.encode(png),
                    "image/png",
                ),
                Err(e) => ToolResult::error(format!("Screenshot failed: {e}")),
            },
            DeviceAction::Tap | DeviceAction::LongPress => {
                let x = match number(params, "x") {
                    Ok(x) => x,
                    Err(invalid) => return Ok(Err(invalid)),
                };
                let y = match number(params, "y") {
                    Ok(y) => y,
                    Err(invalid) => return Ok(Err(invalid)),
                };
                let (verb, success) = if self.action == DeviceAction::Tap {
                    ("Tap", bridge.tap(x, y).await?)
                } else {
                    ("Long press", bridge.long_press(x, y).await?)
                };
                outcome(
                    success,
                    format!("{verb} at ({x}, {y}) succeeded"),
                    format!("{verb} at ({x}, {y}) failed"),
                )
            }
            DeviceAction::Swipe => {
                let mut coords = [0.0; 4];
                for (slot, key) in coords
                    .iter_mut()
                    .zip(["start_x", "start_y", "end_x", "end_y"])
                {
                    *slot = match number(params, key) {
                        Ok(v) => v,
                        Err(invalid) => return Ok(Err(invalid)),
                    };
                }
                let [sx, sy, ex, ey] = coords;
                let duration = params
                    .get("duration_ms")
                    .and_then(Value::as_f64)
                    .filter(|ms| *ms >= 0.0)
                    .map_or(DEFAULT_SWIPE_MS, |ms| ms as u64);
                let success = bridge
                    .swipe((sx, sy), (ex, ey), Duration::from_millis(duration))
                    .await?;
                outcome(
                    success,
                    format!("Swipe from ({sx}, {sy}) to ({ex}, {ey}) succeeded"),
                    format!("Swipe from ({sx}, {sy}) to ({ex}, {ey}) failed"),
                )
            }
            DeviceAction::Type => {
                let text = match string(params, "text") {
                    Ok(text) => text,
                    Err(invalid) => return Ok(Err(invalid)),
                };
                outcome(
                    bridge.type_text(text).await?,
                    "Text typed successfully".to_string(),
                    "Failed to type text (no focused input field?)".to_string(),
                )
            }
            DeviceAction::PressKey => {
                let key = match string(params, "key") {
                    Ok(key) => key,
                    Err(invalid) => return Ok(Err(invalid)),
                };
                outcome(
                    bridge.press_key(key).await?,
                    format!("Key '{key}' pressed successfully"),
                    format!("Key '{key}' press failed (unknown key?)"),
                )
            }
            DeviceAction::Scroll => {
                let direction = match string(params, "direction") {
                    Ok(direction) => direction,
                    Err(invalid) => return Ok(Err(invalid)),
                };
                outcome(
                    bridge.scroll(direction).await?,
                    format!("Scroll '{direction}' succeeded"),
                    format!("Scroll '{direction}' failed"),
                )
            }
        };
        Ok(Ok(result))
    }
}

#[async_trait]
impl Tool for DeviceTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn input_schema(&self) -> &Value {
        &self.schema
    }

    async fn execute(&self, params: JsonObject) -> anyhow::Result<ToolResult> {
        if !self.bridge.is_connected() {
            return Ok(ToolResult::error(SERVICE_UNAVAILABLE));
        }
        debug!(tool = self.name, "device tool call");
        // Validation failures and outcomes are both plain results.
        Ok(self.run(&params).await?.unwrap_or_else(|invalid| invalid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBridge {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeviceBridge for RecordingBridge {
        fn is_connected(&self) -> bool {
            true
        }

        async fn screen_tree(&self, include_off_screen: bool) -> anyhow::Result<Value> {
            Ok(json!({"root": "FrameLayout", "offScreen": include_off_screen}))
        }

        async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }

        async fn tap(&self, x: f64, y: f64) -> anyhow::Result<bool> {
            self.calls.lock().push(format!("tap {x} {y}"));
            Ok(true)
        }

        async fn long_press(&self, _x: f64, _y: f64) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn swipe(
            &self,
            from: (f64, f64),
            to: (f64, f64),
            duration: Duration,
        ) -> anyhow::Result<bool> {
            self.calls.lock().push(format!(
                "swipe {:?} {:?} {}",
                from,
                to,
                duration.as_millis()
            ));
            Ok(true)
        }

        async fn type_text(&self, _text: &str) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn press_key(&self, key: &str) -> anyhow::Result<bool> {
            Ok(key == "back")
        }

        async fn scroll(&self, _direction: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn find(tools: Vec<DeviceTool>, name: &str) -> DeviceTool {
        tools.into_iter().find(|t| t.name == name).unwrap()
    }

    fn params(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_disconnected_bridge_reports_unavailable() {
        for tool in device_tools(Arc::new(DisconnectedBridge)) {
            let result = tool.execute(JsonObject::new()).await.unwrap();
            assert!(result.is_error, "{} should fail", tool.name);
            assert_eq!(result.joined_text(), SERVICE_UNAVAILABLE);
        }
    }

    #[tokio::test]
    async fn test_tap_validates_and_forwards() {
        let bridge = Arc::new(RecordingBridge::default());
        let tap = find(device_tools(bridge.clone()), "device.tap");

        let missing = tap.execute(params(json!({"x": 10}))).await.unwrap();
        assert!(missing.is_error);
        assert_eq!(missing.joined_text(), "Missing required parameter: y");

        let ok = tap.execute(params(json!({"x": 10, "y": "20.5"}))).await.unwrap();
        assert!(!ok.is_error);
        assert_eq!(ok.joined_text(), "Tap at (10, 20.5) succeeded");
        assert_eq!(bridge.calls.lock().as_slice(), ["tap 10 20.5"]);
    }

    #[tokio::test]
    async fn test_swipe_defaults_duration() {
        let bridge = Arc::new(RecordingBridge::default());
        let swipe = find(device_tools(bridge.clone()), "device.swipe");
        let result = swipe
            .execute(params(json!({"start_x": 0, "start_y": 100, "end_x": 0, "end_y": 900})))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(
            bridge.calls.lock().as_slice(),
            ["swipe (0.0, 100.0) (0.0, 900.0) 300"]
        );
    }

    #[tokio::test]
    async fn test_failed_gesture_is_error_result() {
        let tools = device_tools(Arc::new(RecordingBridge::default()));
        let press = find(tools, "device.press_key");
        let result = press.execute(params(json!({"key": "menu"}))).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.joined_text(), "Key 'menu' press failed (unknown key?)");
    }

    #[tokio::test]
    async fn test_screenshot_is_base64_png() {
        let shot = find(
            device_tools(Arc::new(RecordingBridge::default())),
            "device.screenshot",
        );
        let result = shot.execute(JsonObject::new()).await.unwrap();
        assert_eq!(
            result.content,
            vec![crate::tool::ToolContent::image("iVBORw==", "image/png")]
        );
    }
}

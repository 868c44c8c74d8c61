//! Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use flint_hub::apps::{InstalledApp, PackageEvent, PackageSource, PackageWatch};
use flint_hub::provider::{verbs, Extras, ProviderError, ProviderInfo, ProviderTransport};
use flint_hub::tool::{empty_schema, JsonObject, Tool, ToolResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};

pub const SUFFIX: &str = ".flint";

pub fn authority(package: &str) -> String {
    format!("{package}{SUFFIX}")
}

pub fn params(value: Value) -> JsonObject {
    value.as_object().cloned().unwrap_or_default()
}

pub fn extras(value: Value) -> Extras {
    params(value)
}

// ==================== Fake providers ====================

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Unavailable,
    PermissionDenied,
}

impl Failure {
    fn error(self) -> ProviderError {
        match self {
            Failure::Unavailable => ProviderError::Unavailable("provider crashed".to_string()),
            Failure::PermissionDenied => {
                ProviderError::PermissionDenied("caller not allowed".to_string())
            }
        }
    }
}

/// Scripted behavior of one provider.
#[derive(Debug, Clone, Default)]
pub struct FakeApp {
    /// Package reported as the provider's owner; defaults to the app itself
    pub owner: Option<String>,
    pub schema: Option<String>,
    pub schema_error: Option<String>,
    pub fail: Option<Failure>,
    pub tool_reply: Extras,
    /// Successive `get_screen` answers; the last one repeats
    pub screens: Vec<String>,
    pub snapshot: Option<String>,
    pub action_success: bool,
    /// Number of upcoming `get_screen` calls that fail
    pub screen_errors: usize,
    /// `get_screen` never answers
    pub screen_hang: bool,
    /// `get_schema` waits for a permit before answering
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeApp {
    pub fn with_schema(schema: Value) -> Self {
        Self {
            schema: Some(schema.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub authority: String,
    pub verb: String,
    pub extras: Extras,
}

#[derive(Default)]
pub struct FakeTransport {
    apps: Mutex<HashMap<String, FakeApp>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(&self, package: &str, app: FakeApp) {
        self.apps.lock().insert(authority(package), app);
    }

    pub fn uninstall(&self, package: &str) {
        self.apps.lock().remove(&authority(package));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, verb: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.verb == verb).collect()
    }
}

#[async_trait]
impl ProviderTransport for FakeTransport {
    async fn resolve(&self, authority: &str) -> Result<Option<ProviderInfo>, ProviderError> {
        let apps = self.apps.lock();
        Ok(apps.get(authority).map(|app| ProviderInfo {
            package: app
                .owner
                .clone()
                .unwrap_or_else(|| authority.trim_end_matches(SUFFIX).to_string()),
        }))
    }

    async fn call(
        &self,
        authority: &str,
        verb: &str,
        extras: Extras,
    ) -> Result<Extras, ProviderError> {
        self.calls.lock().push(Call {
            authority: authority.to_string(),
            verb: verb.to_string(),
            extras,
        });

        let (reply, gate, hang) = {
            let mut apps = self.apps.lock();
            let Some(app) = apps.get_mut(authority) else {
                return Err(ProviderError::Unavailable(format!("{authority} not installed")));
            };
            if let Some(failure) = app.fail {
                return Err(failure.error());
            }
            if verb == verbs::GET_SCREEN && !app.screen_hang && app.screen_errors > 0 {
                app.screen_errors -= 1;
                return Err(Failure::Unavailable.error());
            }
            let hang = verb == verbs::GET_SCREEN && app.screen_hang;
            let gate = app.gate.clone().filter(|_| verb == verbs::GET_SCHEMA);
            (reply_for(app, verb), gate, hang)
        };

        if hang {
            return std::future::pending().await;
        }
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        reply
    }
}

fn reply_for(app: &mut FakeApp, verb: &str) -> Result<Extras, ProviderError> {
    let mut reply = Extras::new();
    match verb {
        verbs::GET_SCHEMA => {
            if let Some(schema) = &app.schema {
                reply.insert("schema".to_string(), json!(schema));
            }
            if let Some(error) = &app.schema_error {
                reply.insert("_error".to_string(), json!(error));
            }
        }
        verbs::CALL_TOOL => reply = app.tool_reply.clone(),
        verbs::GET_SCREEN => {
            let screen = if app.screens.len() > 1 {
                app.screens.remove(0)
            } else {
                app.screens.first().cloned().unwrap_or_default()
            };
            reply.insert("screen".to_string(), json!(screen));
        }
        verbs::READ_SCREEN => {
            if let Some(snapshot) = &app.snapshot {
                reply.insert("snapshot".to_string(), json!(snapshot));
            }
        }
        verbs::INVOKE_ACTION => {
            reply.insert("success".to_string(), json!(app.action_success));
        }
        other => return Err(ProviderError::Remote(format!("unknown verb {other}"))),
    }
    Ok(reply)
}

// ==================== Fake package manager ====================

#[derive(Default)]
pub struct StaticPackages {
    apps: Mutex<Vec<InstalledApp>>,
    events: Mutex<Option<broadcast::Sender<PackageEvent>>>,
}

impl StaticPackages {
    pub fn new(apps: &[(&str, &str)]) -> Arc<Self> {
        let packages = Arc::new(Self::default());
        for (package, label) in apps {
            packages.add(package, label);
        }
        packages
    }

    pub fn add(&self, package: &str, label: &str) {
        self.apps.lock().push(InstalledApp {
            package: package.to_string(),
            label: label.to_string(),
        });
    }

    pub fn remove(&self, package: &str) {
        self.apps.lock().retain(|app| app.package != package);
    }

    /// Deliver an event to the registered listener, if any.
    pub fn emit(&self, event: PackageEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_watched(&self) -> bool {
        self.events.lock().is_some()
    }
}

impl PackageSource for StaticPackages {
    fn installed_apps(&self) -> anyhow::Result<Vec<InstalledApp>> {
        Ok(self.apps.lock().clone())
    }

    fn watch(&self, events: broadcast::Sender<PackageEvent>) -> anyhow::Result<PackageWatch> {
        *self.events.lock() = Some(events);
        Ok(PackageWatch::inert())
    }
}

// ==================== Local tools ====================

/// Echoes its `text` parameter.
pub struct EchoTool {
    name: String,
    schema: Value,
}

impl EchoTool {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            schema: empty_schema(),
        })
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echo the text parameter"
    }

    fn input_schema(&self) -> &Value {
        &self.schema
    }

    async fn execute(&self, params: JsonObject) -> anyhow::Result<ToolResult> {
        let text = params.get("text").and_then(Value::as_str).unwrap_or("");
        Ok(ToolResult::text(text))
    }
}

/// Always fails with an `Err`.
pub struct FailingTool {
    schema: Value,
}

impl FailingTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            schema: empty_schema(),
        })
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "test.explode"
    }

    fn description(&self) -> &str {
        "Fails every time"
    }

    fn input_schema(&self) -> &Value {
        &self.schema
    }

    async fn execute(&self, _params: JsonObject) -> anyhow::Result<ToolResult> {
        anyhow::bail!("boom")
    }
}

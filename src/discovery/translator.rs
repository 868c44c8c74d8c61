//! Schema translator - discovered app to namespaced tools

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::remote::{ActionTool, AppEndpoint, GetScreenTool, ReadScreenTool, RemoteTool, VerifyPolicy};
use super::schema::DiscoveredApp;
use crate::provider::ProviderTransport;
use crate::tool::SharedTool;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("label {0:?} yields an empty tool namespace")]
    EmptyPrefix(String),
}

/// Tool namespace for an app label: lowercased, spaces become underscores,
/// anything outside `[a-z0-9_]` is dropped. `"Music App!"` gives `music_app`.
pub fn derive_prefix(label: &str) -> String {
    label
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
        .collect()
}

pub struct Translator {
    transport: Arc<dyn ProviderTransport>,
    verify: VerifyPolicy,
}

impl Translator {
    pub fn new(transport: Arc<dyn ProviderTransport>) -> Self {
        Self {
            transport,
            verify: VerifyPolicy::default(),
        }
    }

    pub fn with_verify_policy(mut self, verify: VerifyPolicy) -> Self {
        self.verify = verify;
        self
    }

    /// One tool per declared definition plus the three standard tools
    /// (`read_screen`, `get_screen`, `action`).
    pub fn translate_app(&self, app: &DiscoveredApp) -> Result<Vec<SharedTool>, TranslateError> {
        let prefix = derive_prefix(&app.label);
        if prefix.is_empty() {
            return Err(TranslateError::EmptyPrefix(app.label.clone()));
        }

        let endpoint = Arc::new(AppEndpoint::new(
            self.transport.clone(),
            &app.authority,
            &app.label,
        ));

        let mut tools: Vec<SharedTool> = app
            .schema
            .tools
            .iter()
            .map(|def| {
                Arc::new(RemoteTool::new(
                    endpoint.clone(),
                    &prefix,
                    def.clone(),
                    self.verify,
                )) as SharedTool
            })
            .collect();

        tools.push(Arc::new(ReadScreenTool::new(endpoint.clone(), &prefix)));
        tools.push(Arc::new(GetScreenTool::new(endpoint.clone(), &prefix)));
        tools.push(Arc::new(ActionTool::new(endpoint, &prefix)));

        info!(app = %app.label, prefix = %prefix, tools = tools.len(), "translated app tools");
        Ok(tools)
    }
}

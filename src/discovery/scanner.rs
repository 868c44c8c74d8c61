//! Discovery scanner - finds providers among installed apps

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::schema::{parse_schema, DiscoveredApp};
use crate::apps::{fallback_label, InstalledApp, PackageEvent, PackageSource, PackageWatch};
use crate::provider::{
    reply_str, verbs, Extras, ProviderError, ProviderInfo, ProviderTransport, ERROR_KEY,
};

const CHANGE_CAPACITY: usize = 64;

/// Decides whether a resolved provider may be queried.
#[derive(Debug, Clone, Copy)]
pub struct ProviderTrust {
    dev_mode: bool,
}

impl ProviderTrust {
    pub fn new(dev_mode: bool) -> Self {
        Self { dev_mode }
    }

    /// In dev mode every provider is trusted. Otherwise the provider must be
    /// owned by the package it was derived from.
    pub fn is_trusted(&self, provider: &ProviderInfo, expected_package: &str) -> bool {
        self.dev_mode || provider.package == expected_package
    }
}

impl Default for ProviderTrust {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Scans installed applications for capability providers.
pub struct Scanner {
    packages: Arc<dyn PackageSource>,
    transport: Arc<dyn ProviderTransport>,
    trust: ProviderTrust,
    authority_suffix: String,
    changes: broadcast::Sender<PackageEvent>,
    listener: Mutex<Option<PackageWatch>>,
}

impl Scanner {
    pub fn new(
        packages: Arc<dyn PackageSource>,
        transport: Arc<dyn ProviderTransport>,
        authority_suffix: impl Into<String>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            packages,
            transport,
            trust: ProviderTrust::default(),
            authority_suffix: authority_suffix.into(),
            changes,
            listener: Mutex::new(None),
        }
    }

    pub fn with_trust(mut self, trust: ProviderTrust) -> Self {
        self.trust = trust;
        self
    }

    /// Provider authority for `package`.
    pub fn authority_for(&self, package: &str) -> String {
        format!("{package}{}", self.authority_suffix)
    }

    /// Stream of install/uninstall/update events. Delivery only starts once
    /// [`register_listener`](Self::register_listener) has been called.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<PackageEvent> {
        self.changes.subscribe()
    }

    /// Start listening for package events. Safe to call more than once.
    pub fn register_listener(&self) -> anyhow::Result<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(());
        }
        *listener = Some(self.packages.watch(self.changes.clone())?);
        info!("package change listener registered");
        Ok(())
    }

    pub fn unregister_listener(&self) {
        if self.listener.lock().take().is_some() {
            info!("package change listener unregistered");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Query every installed app for a provider schema. Never fails: apps
    /// that cannot be reached or parsed are logged and left out.
    pub async fn scan(&self) -> Vec<DiscoveredApp> {
        let installed = match self.packages.installed_apps() {
            Ok(apps) => apps,
            Err(e) => {
                error!("failed to list installed apps: {e:#}");
                return Vec::new();
            }
        };

        debug!(count = installed.len(), "scanning installed apps for providers");
        self.transport.refresh().await;

        let mut discovered = Vec::new();
        for app in installed {
            let authority = self.authority_for(&app.package);
            match self.transport.resolve(&authority).await {
                Ok(Some(provider)) => {
                    debug!(authority = %authority, "found provider");
                    if let Some(found) = self.query_app(&app, &authority, &provider).await {
                        info!(
                            app = %found.label,
                            package = %found.package,
                            tools = found.schema.tools.len(),
                            "discovered app"
                        );
                        discovered.push(found);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(authority = %authority, "skipping: {e}"),
            }
        }

        info!(apps = discovered.len(), "scan complete");
        discovered
    }

    async fn query_app(
        &self,
        app: &InstalledApp,
        authority: &str,
        provider: &ProviderInfo,
    ) -> Option<DiscoveredApp> {
        if !self.trust.is_trusted(provider, &app.package) {
            warn!(
                authority = %authority,
                owner = %provider.package,
                "provider not owned by {}, skipping",
                app.package
            );
            return None;
        }

        let reply = match self
            .transport
            .call(authority, verbs::GET_SCHEMA, Extras::new())
            .await
        {
            Ok(reply) => reply,
            Err(ProviderError::PermissionDenied(msg)) => {
                warn!(authority = %authority, "permission denied: {msg}");
                return None;
            }
            Err(e) => {
                warn!(authority = %authority, "error querying provider: {e}");
                return None;
            }
        };

        let raw = reply_str(&reply, "schema").unwrap_or_default();
        if raw.trim().is_empty() {
            let reason = reply_str(&reply, ERROR_KEY).unwrap_or("empty response");
            warn!(authority = %authority, "no schema: {reason}");
            return None;
        }

        let Some(schema) = parse_schema(raw) else {
            warn!(authority = %authority, "failed to parse schema");
            return None;
        };

        let label = if app.label.trim().is_empty() {
            fallback_label(&app.package)
        } else {
            app.label.clone()
        };

        Some(DiscoveredApp {
            package: app.package.clone(),
            label,
            authority: authority.to_string(),
            schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_outside_dev_mode_checks_owner() {
        let trust = ProviderTrust::new(false);
        let owned = ProviderInfo {
            package: "com.example.music".to_string(),
        };
        assert!(trust.is_trusted(&owned, "com.example.music"));
        assert!(!trust.is_trusted(&owned, "com.example.other"));
        assert!(ProviderTrust::new(true).is_trusted(&owned, "com.example.other"));
    }
}

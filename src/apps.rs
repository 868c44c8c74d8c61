//! Installed-application source.
//!
//! On the host the "package manager" is a directory with one subdirectory
//! per installed app, each holding an `app.toml` manifest:
//!
//! ```toml
//! package = "com.example.music"
//! label = "Music App"
//!
//! [provider]
//! authority = "com.example.music.flint"
//! command = "python3"
//! args = ["provider.py"]
//! ```
//!
//! Apps without a `[provider]` table are installed but expose nothing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::warn;

use crate::watcher::AppWatcher;

/// Manifest file name inside each app directory.
pub const MANIFEST_FILE: &str = "app.toml";

/// An installed application as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApp {
    pub package: String,
    pub label: String,
}

/// Install/uninstall notification from a [`PackageSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageEvent {
    /// A package was installed or updated
    Changed(String),
    /// A package was uninstalled
    Removed(String),
    /// The event source itself failed
    Error(String),
}

/// Keeps a package listener alive. Dropping it stops event delivery.
pub struct PackageWatch {
    _guard: Option<Box<dyn Send>>,
}

impl PackageWatch {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Some(Box::new(guard)),
        }
    }

    /// A listener for sources that never emit events.
    pub fn inert() -> Self {
        Self { _guard: None }
    }
}

/// Enumerates installed applications and reports install/uninstall events.
pub trait PackageSource: Send + Sync {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>>;

    /// Start delivering [`PackageEvent`]s into `events`.
    fn watch(&self, events: broadcast::Sender<PackageEvent>) -> Result<PackageWatch>;
}

/// Process launch description for an app's provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderManifest {
    pub authority: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Contents of an `app.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppManifest {
    pub package: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub provider: Option<ProviderManifest>,
}

impl AppManifest {
    /// Display label, falling back to the last dotted segment of the package.
    pub fn display_label(&self) -> String {
        match self.label.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => fallback_label(&self.package),
        }
    }
}

/// Last dotted segment of a package id.
pub fn fallback_label(package: &str) -> String {
    package.rsplit('.').next().unwrap_or(package).to_string()
}

/// A loaded manifest together with the directory it came from.
#[derive(Debug, Clone)]
pub struct AppEntry {
    pub dir: PathBuf,
    pub manifest: AppManifest,
}

/// Directory-backed [`PackageSource`].
#[derive(Debug, Clone)]
pub struct AppDirectory {
    root: PathBuf,
}

impl AppDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Load every readable manifest. Broken manifests are skipped.
    pub fn entries(&self) -> Result<Vec<AppEntry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let dir = fs::read_dir(&self.root)
            .with_context(|| format!("failed to read app directory {}", self.root.display()))?;

        let mut entries = Vec::new();
        for entry in dir.flatten() {
            let path = entry.path();
            let hidden = entry
                .file_name()
                .to_str()
                .map_or(true, |n| n.starts_with('.') || n.starts_with('_'));
            if !path.is_dir() || hidden {
                continue;
            }
            let manifest_path = path.join(MANIFEST_FILE);
            if !manifest_path.exists() {
                continue;
            }
            match load_manifest(&manifest_path) {
                Ok(manifest) => entries.push(AppEntry {
                    dir: path,
                    manifest,
                }),
                Err(e) => warn!(path = %manifest_path.display(), "skipping app manifest: {e:#}"),
            }
        }
        entries.sort_by(|a, b| a.manifest.package.cmp(&b.manifest.package));
        Ok(entries)
    }

    /// Apps that declare a provider, keyed by provider authority.
    pub fn providers(&self) -> Result<HashMap<String, AppEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|entry| {
                let authority = entry.manifest.provider.as_ref()?.authority.clone();
                Some((authority, entry))
            })
            .collect())
    }
}

impl PackageSource for AppDirectory {
    fn installed_apps(&self) -> Result<Vec<InstalledApp>> {
        Ok(self
            .entries()?
            .into_iter()
            .map(|entry| InstalledApp {
                label: entry.manifest.display_label(),
                package: entry.manifest.package,
            })
            .collect())
    }

    fn watch(&self, events: broadcast::Sender<PackageEvent>) -> Result<PackageWatch> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        AppWatcher::new(self.root.clone(), events).start()
    }
}

fn load_manifest(path: &Path) -> Result<AppManifest> {
    let content = fs::read_to_string(path)?;
    let manifest: AppManifest = toml::from_str(&content)?;
    Ok(manifest)
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::provider::DEFAULT_CALL_TIMEOUT;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Bearer token for the MCP endpoints. Blank disables auth.
    pub auth_token: String,
    pub localhost_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_token: String::new(),
            localhost_only: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub apps_dir: PathBuf,
    pub authority_suffix: String,
    /// Trust every provider regardless of which package owns it
    pub dev_mode: bool,
    pub watch: bool,
    pub call_timeout_ms: u64,
    pub verify_timeout_ms: u64,
    pub verify_interval_ms: u64,
    pub rescan_debounce_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            apps_dir: default_apps_dir(),
            authority_suffix: ".flint".to_string(),
            dev_mode: true,
            watch: true,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            verify_timeout_ms: 2_000,
            verify_interval_ms: 100,
            rescan_debounce_ms: 500,
        }
    }
}

impl DiscoveryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    pub fn rescan_debounce(&self) -> Duration {
        Duration::from_millis(self.rescan_debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub enabled: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_apps_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".flint-hub").join("apps")
}

impl HubConfig {
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Default location: `$HOME/.flint-hub/config.toml`.
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".flint-hub").join("config.toml")
    }

    pub fn auth_enabled(&self) -> bool {
        !self.server.auth_token.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.server.localhost_only);
        assert!(!config.auth_enabled());
        assert_eq!(config.discovery.authority_suffix, ".flint");
        assert_eq!(config.discovery.verify_interval(), Duration::from_millis(100));
        assert!(config.device.enabled);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9090\nauth_token = \"secret\"\n\n[discovery]\ndev_mode = false\n",
        )
        .unwrap();

        let config = HubConfig::load(path).unwrap();
        assert_eq!(config.server.port, 9090);
        assert!(config.server.localhost_only);
        assert!(config.auth_enabled());
        assert!(!config.discovery.dev_mode);
        assert_eq!(config.discovery.call_timeout_ms, 10_000);
    }

    #[test]
    fn test_blank_token_disables_auth() {
        let mut config = HubConfig::default();
        config.server.auth_token = "   ".to_string();
        assert!(!config.auth_enabled());
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(HubConfig::load(path).is_err());
    }
}

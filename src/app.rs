use directories::BaseDirs;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;
use crate::sync::EngineSettings;

fn default_deferred_window_ms() -> u64 {
    10_000
}

fn default_deferred_capacity() -> usize {
    256
}

fn default_anomaly_capacity() -> usize {
    128
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_history_page_size() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: String,
    /// Socket endpoint; derived from `base_url` when unset.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "default_deferred_window_ms")]
    pub deferred_window_ms: u64,
    #[serde(default = "default_deferred_capacity")]
    pub deferred_capacity: usize,
    #[serde(default = "default_anomaly_capacity")]
    pub anomaly_capacity: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            password: String::new(),
            token: None,
            user_id: String::new(),
            ws_url: None,
            deferred_window_ms: default_deferred_window_ms(),
            deferred_capacity: default_deferred_capacity(),
            anomaly_capacity: default_anomaly_capacity(),
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            history_page_size: default_history_page_size(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // TOML is preferred, but a JSON fallback is available. Legacy json is converted to toml where possible
    pub fn default_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("schoolchat.toml"))
    }

    fn legacy_json_path() -> Option<PathBuf> {
        let proj = directories::ProjectDirs::from("com", "example", "SchoolChat")?;
        Some(proj.config_dir().join("state.json"))
    }

    /// Loads from the default location, migrating the legacy json file. Falls back to defaults.
    pub fn load() -> Self {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(cfg) => return cfg,
                    Err(e) => warn!("ignoring unreadable config {}: {}", path.display(), e),
                }
            }
        }

        if let Some(legacy) = Self::legacy_json_path() {
            if let Ok(bytes) = fs::read(&legacy) {
                if let Ok(cfg) = serde_json::from_slice::<ClientConfig>(&bytes) {
                    match cfg.save() {
                        Ok(()) => info!("migrated {} to toml", legacy.display()),
                        Err(e) => warn!("could not migrate legacy config: {}", e),
                    }
                    return cfg;
                }
            }
        }

        Self::new()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn require(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("base_url"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::Missing("user_id"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn websocket_url(&self) -> Result<Url, url::ParseError> {
        match &self.ws_url {
            Some(ws) => Url::parse(ws),
            None => crate::utils::websocket_url(&self.base_url),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            deferred_window: Duration::from_millis(self.deferred_window_ms),
            deferred_capacity: self.deferred_capacity,
            anomaly_capacity: self.anomaly_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "base_url = \"school.example\"\nuser_id = \"u1\"\n").unwrap();

        let cfg = ClientConfig::load_from(&path).unwrap();
        assert_eq!(cfg.base_url, "school.example");
        assert_eq!(cfg.deferred_window_ms, 10_000);
        assert_eq!(cfg.engine_settings().deferred_capacity, 256);
        assert!(cfg.require().is_ok());
        assert_eq!(
            cfg.websocket_url().unwrap().as_str(),
            "wss://school.example/socket"
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cfg.toml");
        let mut cfg = ClientConfig::new();
        cfg.base_url = "https://school.example".into();
        cfg.token = Some("tok".into());
        cfg.ws_url = Some("ws://localhost:9000/ws".into());
        cfg.save_to(&path).unwrap();

        let loaded = ClientConfig::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.websocket_url().unwrap().port(), Some(9000));
    }

    #[test]
    fn missing_fields_are_reported() {
        let cfg = ClientConfig::new();
        assert!(matches!(cfg.require(), Err(ConfigError::Missing("base_url"))));
    }
}

//! Konfiguration
//!
//! Explizites Konfigurationsobjekt, das beim Erstellen an die CallEngine
//! übergeben wird: ICE-Server, Media-Quellen und Signaling-Store.

use crate::signaling::MIN_POLL_INTERVAL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Env-Variable mit einer JSON-Liste von ICE-Servern
pub const ENV_ICE_SERVERS: &str = "GIFT_CALL_ICE_SERVERS";
/// Env-Variable mit dem Pfad zur Signaling-Datenbank
pub const ENV_STORE_PATH: &str = "GIFT_CALL_STORE_PATH";
/// Env-Variable mit der App-ID (Namespace der Call-Records)
pub const ENV_APP_ID: &str = "GIFT_CALL_APP_ID";

/// Namespace, wenn keine App-ID gesetzt ist
pub const DEFAULT_NAMESPACE: &str = "calls";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {reason}")]
    InvalidEnv { name: &'static str, reason: String },

    #[error("Could not determine app data directory")]
    NoDataDir,
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein STUN/TURN Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: String::new(),
            credential: String::new(),
        }
    }
}

/// Standard STUN/TURN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server
        IceServerConfig::stun(&["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"]),
        IceServerConfig::stun(&["stun:stun2.l.google.com:19302", "stun:stun3.l.google.com:19302"]),
        // TURN als Fallback, falls keine direkte Verbindung möglich ist
        IceServerConfig {
            urls: vec![
                "turn:turnserver.twilio.com:3478?transport=udp".to_string(),
                "turn:turnserver.twilio.com:3479?transport=tcp".to_string(),
            ],
            username: "webrtc".to_string(),
            credential: "webrtcpassword".to_string(),
        },
    ]
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// Welche lokalen Tracks angefordert werden
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Signaling-Store Einstellungen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Pfad zur SQLite-Datei; ohne Angabe im App-Datenverzeichnis
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// App-ID; trennt die Call-Records verschiedener Apps in einer Datei
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            app_id: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn namespace(&self) -> &str {
        self.app_id.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Polling-Intervall, mindestens `MIN_POLL_INTERVAL`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(MIN_POLL_INTERVAL)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    pub fn resolve_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }

        let proj_dirs = directories::ProjectDirs::from("com", "giftcall", "gift-call")
            .ok_or(ConfigError::NoDataDir)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("signaling.db");
        Ok(path)
    }
}

/// Gesamte Konfiguration einer CallEngine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(default = "default_pool_size")]
    pub ice_candidate_pool_size: u8,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_pool_size() -> u8 {
    20
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_candidate_pool_size: default_pool_size(),
            media: MediaConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus einer JSON-Datei
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Wendet Env-Überschreibungen an. `lookup` liefert den Wert einer Variable.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(raw) = lookup(ENV_ICE_SERVERS) {
            self.ice_servers =
                serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidEnv {
                    name: ENV_ICE_SERVERS,
                    reason: e.to_string(),
                })?;
        }

        if let Some(path) = lookup(ENV_STORE_PATH).filter(|p| !p.trim().is_empty()) {
            self.store.path = Some(PathBuf::from(path));
        }

        if let Some(app_id) = lookup(ENV_APP_ID).filter(|a| !a.trim().is_empty()) {
            self.store.app_id = Some(app_id.trim().to_string());
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_contain_stun_and_turn() {
        let config = CallConfig::default();

        assert_eq!(config.ice_candidate_pool_size, 20);
        assert!(config
            .ice_servers
            .iter()
            .any(|s| s.urls.iter().any(|u| u.starts_with("stun:"))));
        assert!(config
            .ice_servers
            .iter()
            .any(|s| s.urls.iter().any(|u| u.starts_with("turn:")) && !s.credential.is_empty()));
        assert_eq!(config.store.namespace(), DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_ICE_SERVERS, r#"[{"urls":["stun:example.org:3478"]}]"#),
            (ENV_STORE_PATH, "/tmp/calls.db"),
            (ENV_APP_ID, " demo-app "),
        ]
        .into_iter()
        .collect();

        let config = CallConfig::default()
            .with_env_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.ice_servers, vec![IceServerConfig::stun(&["stun:example.org:3478"])]);
        assert_eq!(config.store.resolve_path().unwrap(), PathBuf::from("/tmp/calls.db"));
        assert_eq!(config.store.namespace(), "demo-app");
    }

    #[test]
    fn test_invalid_ice_env_is_reported() {
        let err = CallConfig::default()
            .with_env_overrides(|name| (name == ENV_ICE_SERVERS).then(|| "nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: ENV_ICE_SERVERS, .. }));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"media":{"audio":true,"video":false}}"#).unwrap();

        let config = CallConfig::from_file(&path).unwrap();
        assert!(!config.media.video);
        assert_eq!(config.ice_servers, default_ice_servers());
        assert_eq!(config.store.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_zero_poll_interval_is_raised_to_minimum() {
        let config: CallConfig =
            serde_json::from_str(r#"{"store":{"poll_interval_ms":0}}"#).unwrap();

        assert_eq!(config.store.poll_interval_ms, 0);
        assert!(!config.store.poll_interval().is_zero());
        assert_eq!(config.store.poll_interval(), MIN_POLL_INTERVAL);
    }
}

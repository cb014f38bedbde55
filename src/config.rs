//! Persistent client settings
//!
//! Stored as TOML in the platform config directory. Every field has a
//! default so a partial or missing file still loads.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::constants::*;
use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub transport: TransportConfig,
    pub playback: PlaybackConfig,
    pub discovery: DiscoveryConfig,
}

/// Client identity announced to servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Stable id, generated on first run
    pub client_id: Uuid,
    /// Display name shown by the server
    pub name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            client_id: Uuid::new_v4(),
            name: if host.is_empty() {
                "Sendspin Player".to_string()
            } else {
                host
            },
        }
    }
}

/// Connection transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Last server the client connected to (`ws://` or `wss://`)
    pub server_url: Option<String>,
    /// Bearer token sent on the WebSocket upgrade
    pub auth_token: Option<String>,
    /// Reconnect attempts before giving up
    pub max_attempts: u32,
    pub ping_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Frames replayed to a late text subscriber
    pub text_replay: usize,
    /// Frames replayed to a late binary subscriber
    pub binary_replay: usize,
    /// Reconnect when the server closes the connection cleanly
    pub reconnect_on_server_close: bool,
}

impl TransportConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            auth_token: None,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            ping_interval_ms: PING_INTERVAL.as_millis() as u64,
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            text_replay: 16,
            binary_replay: 0,
            reconnect_on_server_close: true,
        }
    }
}

/// Audio output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device name; the system default when unset
    pub device: Option<String>,
    /// Decoded audio buffered ahead of the device
    pub buffer_ms: u32,
    /// Initial volume, 0-100
    pub volume: u8,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            buffer_ms: DEFAULT_BUFFER_MS,
            volume: 100,
        }
    }
}

/// mDNS settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Port advertised in the client's service record
    pub port: u16,
    /// Path advertised in the client's TXT record
    pub path: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_SERVER_PORT,
            path: DEFAULT_SERVER_PATH.to_string(),
        }
    }
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("io", "sendspin", "sendspin-client")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load `path`, or write and return the defaults when it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        config.save(path)?;
        tracing::info!(path = %path.display(), "wrote default config");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [transport]
            server_url = "ws://10.0.0.2:8927/sendspin"
            max_attempts = 3

            [playback]
            volume = 40
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.server_url.as_deref(), Some("ws://10.0.0.2:8927/sendspin"));
        assert_eq!(config.transport.max_attempts, 3);
        assert!(config.transport.reconnect_on_server_close);
        assert_eq!(config.transport.ping_interval(), PING_INTERVAL);
        assert_eq!(config.playback.volume, 40);
        assert_eq!(config.playback.buffer_ms, DEFAULT_BUFFER_MS);
        assert_eq!(config.discovery.path, DEFAULT_SERVER_PATH);
    }

    #[test]
    fn test_load_or_default_persists_identity() {
        let dir = std::env::temp_dir().join(format!("sendspin-config-{}", Uuid::new_v4()));
        let path = dir.join(CONFIG_FILE);

        let first = AppConfig::load_or_default(&path).unwrap();
        assert!(path.exists());
        let second = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(first.client.client_id, second.client.client_id);
        assert_eq!(first, second);

        std::fs::remove_dir_all(dir).unwrap();
    }
}

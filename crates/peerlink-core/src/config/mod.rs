//! Configuration management for PeerLink.
//!
//! This module handles loading, saving, and managing PeerLink configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/peerlink/config.toml` |
//! | macOS | `~/Library/Application Support/PeerLink/config.toml` |
//! | Windows | `%APPDATA%\PeerLink\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use peerlink_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Device name: {}", config.general.device_name);
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for PeerLink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Network settings
    pub network: NetworkConfig,
    /// Discovery settings
    pub discovery: DiscoveryConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Chat settings
    pub chat: ChatConfig,
    /// Clipboard settings
    pub clipboard: ClipboardConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Hostname announced to peers
    pub device_name: String,
    /// Directory received files are written to
    pub save_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "PeerLink Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            save_dir: None,
        }
    }
}

impl GeneralConfig {
    /// Resolve the save directory: configured value, then the download
    /// directory, then home, then the working directory.
    #[must_use]
    pub fn resolved_save_dir(&self) -> PathBuf {
        if let Some(dir) = &self.save_dir {
            return dir.clone();
        }
        directories::UserDirs::new()
            .and_then(|dirs| {
                dirs.download_dir()
                    .map(std::path::Path::to_path_buf)
                    .or_else(|| Some(dirs.home_dir().to_path_buf()))
            })
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Network configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// LAN address to announce (auto-detected when unset)
    pub local_ip: Option<IpAddr>,
    /// Discovery port (UDP)
    pub discovery_port: u16,
    /// Multicast group for heartbeats
    pub multicast_group: Ipv4Addr,
    /// Multicast TTL
    pub multicast_ttl: u32,
    /// File transfer port (TCP)
    pub transfer_port: u16,
    /// Chat port (TCP)
    pub chat_port: u16,
    /// Clipboard port (TCP)
    pub clipboard_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_ip: None,
            discovery_port: crate::DEFAULT_DISCOVERY_PORT,
            multicast_group: crate::DEFAULT_MULTICAST_GROUP,
            multicast_ttl: 1,
            transfer_port: crate::DEFAULT_TRANSFER_PORT,
            chat_port: crate::DEFAULT_CHAT_PORT,
            clipboard_port: crate::DEFAULT_CLIPBOARD_PORT,
        }
    }
}

/// Discovery configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How often heartbeats are sent
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Devices silent for longer than this are removed
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    /// How often the registry is swept for stale devices
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Also send heartbeats directly to every known device
    pub unicast_known_peers: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(crate::DEFAULT_HEARTBEAT_SECS),
            stale_after: Duration::from_secs(crate::DEFAULT_STALE_AFTER_SECS),
            sweep_interval: Duration::from_secs(5),
            unicast_known_peers: true,
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per binary frame
    pub chunk_size: usize,
    /// Buffered bytes above which the sender pauses
    pub high_water_mark: u64,
    /// How often the paused sender re-checks the buffer
    #[serde(with = "humantime_serde")]
    pub drain_poll_interval: Duration,
    /// Upper bound on the distance between two progress reports
    pub progress_interval: u64,
    /// Grace period for reading the peer's close frame after a write error
    #[serde(with = "humantime_serde")]
    pub close_grace: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            high_water_mark: crate::DEFAULT_HIGH_WATER_MARK,
            drain_poll_interval: Duration::from_millis(10),
            progress_interval: crate::DEFAULT_PROGRESS_INTERVAL,
            close_grace: Duration::from_millis(500),
        }
    }
}

/// Chat configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Delay before connecting back to a peer that connected to us
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Connect back to unsolicited peers when no session is active
    pub auto_accept: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(crate::DEFAULT_RECONNECT_DELAY_MS),
            auto_accept: true,
        }
    }
}

/// Clipboard configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClipboardConfig {
    /// How often the local clipboard is polled
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Number of history entries kept
    pub history_limit: usize,
    /// Start polling as soon as the node starts
    pub sync_on_start: bool,
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(crate::DEFAULT_CLIPBOARD_POLL_MS),
            history_limit: crate::DEFAULT_CLIPBOARD_HISTORY,
            sync_on_start: false,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(Error::InvalidConfig {
                key: "transfer.chunk_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.transfer.high_water_mark < self.transfer.chunk_size as u64 {
            return Err(Error::InvalidConfig {
                key: "transfer.high_water_mark".to_string(),
                reason: "must be at least one chunk".to_string(),
            });
        }
        if !self.network.multicast_group.is_multicast() {
            return Err(Error::InvalidConfig {
                key: "network.multicast_group".to_string(),
                reason: format!("{} is not a multicast address", self.network.multicast_group),
            });
        }
        if self.clipboard.history_limit == 0 {
            return Err(Error::InvalidConfig {
                key: "clipboard.history_limit".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Directory received files are written to.
    #[must_use]
    pub fn resolved_save_dir(&self) -> PathBuf {
        self.general.resolved_save_dir()
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "peerlink", "PeerLink")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 && duration.as_secs() > 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map_err(serde::de::Error::custom)
                        .and_then(|m| {
                            m.checked_mul(60)
                                .map(Duration::from_secs)
                                .ok_or_else(|| serde::de::Error::custom("duration out of range"))
                        })
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.network.discovery_port, 37821);
        assert_eq!(config.network.transfer_port, 7878);
        assert_eq!(config.network.chat_port, 7879);
        assert_eq!(config.network.clipboard_port, 7880);
        assert_eq!(config.discovery.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.discovery.stale_after, Duration::from_secs(30));
        assert_eq!(config.chat.reconnect_delay, Duration::from_millis(300));
        assert_eq!(config.clipboard.poll_interval, Duration::from_millis(500));
        assert_eq!(config.clipboard.history_limit, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config_path = temp_dir.path().join("config").join("config.toml");

        let mut original = Config::default();
        original.general.device_name = "Test Device".to_string();
        original.general.save_dir = Some(PathBuf::from("/tmp/incoming"));
        original.network.chat_port = 17879;
        original.transfer.chunk_size = 64 * 1024;
        original.save_to(&config_path).expect("save");

        let loaded = Config::load_from(&config_path).expect("load");

        assert_eq!(loaded.general.device_name, "Test Device");
        assert_eq!(loaded.general.save_dir, Some(PathBuf::from("/tmp/incoming")));
        assert_eq!(loaded.network.chat_port, 17879);
        assert_eq!(loaded.transfer.chunk_size, 64 * 1024);
        assert_eq!(loaded.transfer.drain_poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_duration_in_minutes() {
        let config: Config = toml::from_str("[discovery]\nstale_after = \"2m\"\n").expect("parse");
        assert_eq!(config.discovery.stale_after, Duration::from_secs(120));

        let err = toml::from_str::<Config>("[discovery]\nstale_after = \"307445734561825861m\"\n")
            .expect_err("overflowing minutes");
        assert!(err.to_string().contains("duration out of range"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = Config::load_from(&temp_dir.path().join("absent.toml")).expect("load");
        assert_eq!(config.network.transfer_port, crate::DEFAULT_TRANSFER_PORT);
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[general]
device_name = "My Custom Device"

[clipboard]
poll_interval = "250ms"

[discovery]
stale_after = "1m"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.general.device_name, "My Custom Device");
        assert_eq!(config.clipboard.poll_interval, Duration::from_millis(250));
        assert_eq!(config.discovery.stale_after, Duration::from_secs(60));
        assert_eq!(config.transfer.chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_humantime_duration_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");

        assert!(toml_str.contains("heartbeat_interval = \"3s\""));
        assert!(toml_str.contains("reconnect_delay = \"300ms\""));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));

        let mut config = Config::default();
        config.network.multicast_group = Ipv4Addr::new(192, 168, 1, 1);
        assert!(config.validate().is_err());

        let bad: std::result::Result<Config, _> =
            toml::from_str("[chat]\nreconnect_delay = \"soon\"\n");
        assert!(bad.is_err());
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }
}

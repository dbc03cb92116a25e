//! Configuration module
//!
//! Handles loading and saving StratNet configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network;
use crate::protocol::{DISCOVERY_PORT, GAME_PORT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Player identity
    #[serde(default)]
    pub player: PlayerConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// LAN discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Unique player identifier (auto-generated if not set)
    pub player_id: Option<String>,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            player_id: None,
            verbose: false,
            log_file: None,
        }
    }
}

/// Player identity carried in the intro exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Display name (default: hostname)
    #[serde(default = "default_player_name")]
    pub name: String,
    /// Faction to play
    #[serde(default)]
    pub faction: String,
    /// Team number, -1 for unassigned
    #[serde(default = "default_team")]
    pub team: i8,
}

fn default_player_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "player".to_string())
}

fn default_team() -> i8 {
    -1
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            name: default_player_name(),
            faction: String::new(),
            team: default_team(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to host on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Player slots when hosting
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Intro exchange timeout in ms
    #[serde(default = "default_intro_timeout")]
    pub intro_timeout_ms: u64,
    /// Heartbeat interval in ms
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Silence period after which a connection is considered dead, in ms
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_ms: u64,
    /// Ticks to withhold a merge waiting on slow participants
    #[serde(default = "default_grace_window")]
    pub grace_window_ticks: u32,
    /// Consecutive missed ticks before a slot is dropped
    #[serde(default = "default_disconnect_threshold")]
    pub disconnect_threshold_ticks: u32,
}

fn default_port() -> u16 {
    GAME_PORT
}

fn default_max_slots() -> usize {
    network::MAX_SLOTS
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_intro_timeout() -> u64 {
    10000
}

fn default_heartbeat_interval() -> u64 {
    1000
}

fn default_keepalive_timeout() -> u64 {
    15000
}

fn default_grace_window() -> u32 {
    1
}

fn default_disconnect_threshold() -> u32 {
    30
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            max_slots: default_max_slots(),
            connect_timeout_ms: default_connect_timeout(),
            intro_timeout_ms: default_intro_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            keepalive_timeout_ms: default_keepalive_timeout(),
            grace_window_ticks: default_grace_window(),
            disconnect_threshold_ticks: default_disconnect_threshold(),
        }
    }
}

/// LAN discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Answer probes and announce while hosting
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// UDP discovery port
    #[serde(default = "default_discovery_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_discovery_port(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("stratnet/config.toml")),
            Some(PathBuf::from("./stratnet.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the player ID, generating one if not set
    pub fn player_id(&self) -> String {
        self.general
            .player_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// The runtime network configuration this file describes
    pub fn runtime_network(&self) -> network::NetworkConfig {
        network::NetworkConfig {
            game_port: self.network.port,
            bind_address: self.network.bind_address.clone(),
            max_slots: self.network.max_slots,
            connect_timeout: Duration::from_millis(self.network.connect_timeout_ms),
            intro_timeout: Duration::from_millis(self.network.intro_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.network.heartbeat_interval_ms),
            keepalive_timeout: Duration::from_millis(self.network.keepalive_timeout_ms),
            grace_window_ticks: self.network.grace_window_ticks,
            disconnect_threshold_ticks: self.network.disconnect_threshold_ticks,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.network.port, GAME_PORT);
        assert_eq!(config.network.max_slots, network::MAX_SLOTS);
        assert_eq!(config.discovery.port, DISCOVERY_PORT);
        assert!(config.discovery.enabled);

        let runtime = config.runtime_network();
        assert_eq!(runtime.game_port, GAME_PORT);
        assert_eq!(runtime.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.player.name = "alice".to_string();
        config.player.faction = "tech".to_string();
        config.network.port = 12345;
        config.network.disconnect_threshold_ticks = 7;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.player.name, "alice");
        assert_eq!(loaded.network.port, 12345);
        assert_eq!(loaded.network.disconnect_threshold_ticks, 7);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[network]\nport = 999\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.network.port, 999);
        assert_eq!(config.network.max_slots, network::MAX_SLOTS);
        assert_eq!(config.player.team, -1);
    }

    #[test]
    fn test_player_id_stable_when_configured() {
        let mut config = Config::default();
        config.general.player_id = Some("host-7".to_string());
        assert_eq!(config.player_id(), "host-7");

        config.general.player_id = None;
        let minted = config.player_id();
        assert!(!minted.is_empty());
        // Unset ids are minted fresh per call
        assert_ne!(config.player_id(), minted);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::load(Path::new("/nonexistent/stratnet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}

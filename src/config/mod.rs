//! Configuration module
//!
//! Handles loading and saving EngineLink configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::handshake::{EngineType, ENGINE_VERSION};
use crate::protocol::{DEFAULT_PORT, FRAGMENT_SIZE_FULL, HEADER_SIZE, MAX_MSG_SIZE};

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

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Framing settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Version check settings
    #[serde(default)]
    pub handshake: HandshakeConfig,

    /// Liveness monitor settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: None,
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Framing configuration; both endpoints must agree on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest logical message
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Largest wire frame, header included
    #[serde(default = "default_fragment_size_full")]
    pub fragment_size_full: usize,
    /// Embed and verify a MurmurHash2 in every frame
    #[serde(default = "default_true")]
    pub integrity_hash: bool,
}

fn default_max_message_size() -> usize {
    MAX_MSG_SIZE
}

fn default_fragment_size_full() -> usize {
    FRAGMENT_SIZE_FULL
}

fn default_true() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            fragment_size_full: default_fragment_size_full(),
            integrity_hash: default_true(),
        }
    }
}

impl TransportConfig {
    /// Payload bytes that fit in one wire frame
    pub fn frame_capacity(&self) -> usize {
        self.fragment_size_full.saturating_sub(HEADER_SIZE).max(1)
    }
}

/// Version check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// How long to wait for the peer, in ms (0 = forever)
    #[serde(default = "default_handshake_timeout")]
    pub timeout_ms: u64,
    /// Engine subsystem this build belongs to
    #[serde(default)]
    pub engine_type: EngineType,
    /// Build identifier announced to the peer
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_handshake_timeout() -> u64 {
    1000
}

fn default_version() -> String {
    ENGINE_VERSION.to_string()
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_handshake_timeout(),
            engine_type: EngineType::default(),
            version: default_version(),
        }
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Liveness monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Run the liveness monitor
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Probe interval in ms
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
    /// Probes tracked; a full window without answers breaks the session
    #[serde(default = "default_check_duration")]
    pub check_duration: usize,
    /// Newest probes averaged for the latency estimate
    #[serde(default = "default_average_window")]
    pub average_window: usize,
    /// Average latency alarm threshold in seconds (1..=10)
    #[serde(default = "default_max_average_latency")]
    pub max_average_latency_secs: u32,
}

fn default_heartbeat_interval() -> u64 {
    100
}

fn default_check_duration() -> usize {
    30
}

fn default_average_window() -> usize {
    10
}

fn default_max_average_latency() -> u32 {
    1
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_heartbeat_interval(),
            check_duration: default_check_duration(),
            average_window: default_average_window(),
            max_average_latency_secs: default_max_average_latency(),
        }
    }
}

impl HeartbeatConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
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
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("enginelink/config.toml")),
            Some(PathBuf::from("./enginelink.toml")),
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

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        let transport = &self.transport;
        if transport.fragment_size_full <= HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "transport.fragment_size_full must exceed the {} byte header",
                HEADER_SIZE
            )));
        }
        if transport.max_message_size == 0 || transport.max_message_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(
                "transport.max_message_size must be between 1 and 4294967295".to_string(),
            ));
        }

        let heartbeat = &self.heartbeat;
        if heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_ms must be positive".to_string(),
            ));
        }
        if heartbeat.check_duration == 0 || heartbeat.average_window == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.check_duration and heartbeat.average_window must be positive"
                    .to_string(),
            ));
        }
        if !(1..=10).contains(&heartbeat.max_average_latency_secs) {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.max_average_latency_secs must be in 1..=10, got {}",
                heartbeat.max_average_latency_secs
            )));
        }

        if self.handshake.version.contains('\n') {
            return Err(ConfigError::Invalid(
                "handshake.version must not contain a newline".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        network: NetworkConfig {
            bind_address: Some("0.0.0.0".to_string()),
            ..Default::default()
        },
        handshake: HandshakeConfig {
            engine_type: EngineType::InstructionEngine,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.transport.frame_capacity(), 1404);
        assert!(config.transport.integrity_hash);
        assert_eq!(config.handshake.timeout_ms, 1000);
        assert_eq!(config.heartbeat.check_duration, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.transport.integrity_hash = false;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, config.network.port);
        assert_eq!(loaded.transport, config.transport);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[heartbeat]\ninterval_ms = 250\n\n[handshake]\nengine_type = \"InstructionEngine\"").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.heartbeat.interval_ms, 250);
        assert_eq!(loaded.heartbeat.average_window, 10);
        assert_eq!(loaded.handshake.engine_type, EngineType::InstructionEngine);
        assert_eq!(loaded.transport.max_message_size, MAX_MSG_SIZE);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[heartbeat]\nmax_average_latency_secs = 11").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = Config::default();
        config.transport.fragment_size_full = HEADER_SIZE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/enginelink.toml")),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.handshake.engine_type, EngineType::InstructionEngine);
        assert!(parsed.validate().is_ok());
    }
}

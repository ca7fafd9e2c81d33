//! TOML-based configuration for the daemon.
//!
//! Read from `$DEVICELINK_CONFIG` if set, otherwise
//! `~/.config/devicelink/config.toml`. Every field carries a serde default
//! so the daemon works on first run (no file yet) and when upgrading from a
//! config file missing newer fields. On first run a stable device
//! identifier is generated and written back so the device keeps its
//! identity (and its pairings) across restarts.
//!
//! ```toml
//! [device]
//! id = "d1f9799d0f4e4d2fa1f9799d0f4e4d2f"
//! name = "my-desktop"
//! device_type = "desktop"
//!
//! [network]
//! discovery_port = 1716
//! tcp_port_start = 1716
//! tcp_port_end = 1764
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use devicelink_core::is_valid_device_id;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The home/config directory could not be determined.
    #[error("could not determine config directory (HOME not set)")]
    NoConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configured device id does not match `[A-Za-z0-9_-]{32,38}`.
    #[error("configured device id is invalid: {0:?}")]
    InvalidDeviceId(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub daemon: DaemonSection,
}

/// Identity this daemon announces on the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Stable device identifier, `[A-Za-z0-9_-]{32,38}`. Generated on first run.
    #[serde(default = "default_device_id")]
    pub id: String,
    /// Human-readable name shown on the phone during pairing.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Device class: `"desktop"`, `"laptop"`, `"phone"`, `"tablet"`, `"tv"`.
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

/// Network ports and timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// UDP port for presence broadcasts. Fixed by the protocol.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// First TCP port tried for the session listener.
    #[serde(default = "default_tcp_port_start")]
    pub tcp_port_start: u16,
    /// Last TCP port tried for the session listener (inclusive).
    #[serde(default = "default_tcp_port_end")]
    pub tcp_port_end: u16,
    /// Seconds between presence broadcasts.
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,
    /// Seconds between staleness sweeps of the discovered-device registry.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Seconds without a re-announcement before a device is considered lost.
    #[serde(default = "default_device_timeout")]
    pub device_timeout_secs: u64,
    /// Seconds to wait for an identity packet during a handshake.
    #[serde(default = "default_identity_timeout")]
    pub identity_timeout_secs: u64,
    /// Seconds to wait for a peer's answer to a pairing request.
    #[serde(default = "default_pairing_timeout")]
    pub pairing_timeout_secs: u64,
}

/// Certificate material and trust-store location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    /// Path to this device's certificate (PEM). Supplied at startup;
    /// generation is outside the daemon.
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// Path to this device's private key (PEM).
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Directory holding one certificate file per trusted device.
    #[serde(default = "default_trust_dir")]
    pub trust_dir: PathBuf,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonSection {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_id() -> String {
    // uuid-simple is 32 hex chars, inside the protocol's 32..=38 window.
    Uuid::new_v4().simple().to_string()
}
fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "devicelink-desktop".to_string())
}
fn default_device_type() -> String {
    "desktop".to_string()
}
fn default_discovery_port() -> u16 {
    1716
}
fn default_tcp_port_start() -> u16 {
    1716
}
fn default_tcp_port_end() -> u16 {
    1764
}
fn default_broadcast_interval() -> u64 {
    5
}
fn default_sweep_interval() -> u64 {
    10
}
fn default_device_timeout() -> u64 {
    30
}
fn default_identity_timeout() -> u64 {
    10
}
fn default_pairing_timeout() -> u64 {
    30
}
fn default_cert_path() -> PathBuf {
    state_dir().join("certificate.pem")
}
fn default_key_path() -> PathBuf {
    state_dir().join("private.pem")
}
fn default_trust_dir() -> PathBuf {
    state_dir().join("trusted_devices")
}
fn default_log_level() -> String {
    "info".to_string()
}

fn state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("devicelink")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
            name: default_device_name(),
            device_type: default_device_type(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            tcp_port_start: default_tcp_port_start(),
            tcp_port_end: default_tcp_port_end(),
            broadcast_interval_secs: default_broadcast_interval(),
            sweep_interval_secs: default_sweep_interval(),
            device_timeout_secs: default_device_timeout(),
            identity_timeout_secs: default_identity_timeout(),
            pairing_timeout_secs: default_pairing_timeout(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            trust_dir: default_trust_dir(),
        }
    }
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl NetworkConfig {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }
    pub fn identity_timeout(&self) -> Duration {
        Duration::from_secs(self.identity_timeout_secs)
    }
    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }
}

// ── Load / save ───────────────────────────────────────────────────────────────

/// The path the daemon reads its config from.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os("DEVICELINK_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if std::env::var_os("HOME").is_none() {
        return Err(ConfigError::NoConfigDir);
    }
    Ok(state_dir().join("config.toml"))
}

impl DaemonConfig {
    /// Loads the config from `path`, falling back to defaults (and writing
    /// the generated file back) when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for I/O failures, TOML syntax errors, or an
    /// invalid configured device id.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                config
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes the config to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_device_id(&self.device.id) {
            return Err(ConfigError::InvalidDeviceId(self.device.id.clone()));
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_id_is_valid() {
        assert!(is_valid_device_id(&default_device_id()));
    }

    #[test]
    fn test_defaults_match_protocol_parameters() {
        let config = DaemonConfig::default();
        assert_eq!(config.network.discovery_port, 1716);
        assert_eq!(config.network.tcp_port_start, 1716);
        assert_eq!(config.network.tcp_port_end, 1764);
        assert_eq!(config.network.identity_timeout(), Duration::from_secs(10));
        assert_eq!(config.network.broadcast_interval(), Duration::from_secs(5));
        // Sweep must run faster than the eviction window.
        assert!(config.network.sweep_interval() < config.network.device_timeout());
    }

    #[test]
    fn test_partial_toml_fills_in_defaults() {
        let text = r#"
            [device]
            name = "my-desk"

            [network]
            discovery_port = 1717
        "#;
        let config: DaemonConfig = toml::from_str(text).unwrap();
        assert_eq!(config.device.name, "my-desk");
        assert_eq!(config.network.discovery_port, 1717);
        assert_eq!(config.network.tcp_port_end, 1764);
        assert!(is_valid_device_id(&config.device.id));
    }

    #[test]
    fn test_load_or_create_writes_file_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let created = DaemonConfig::load_or_create(&path).unwrap();
        assert!(path.exists());

        // A second load must reproduce the same (generated) device id.
        let reloaded = DaemonConfig::load_or_create(&path).unwrap();
        assert_eq!(reloaded.device.id, created.device.id);
    }

    #[test]
    fn test_load_rejects_invalid_configured_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[device]\nid = \"short\"\n").unwrap();
        assert!(matches!(
            DaemonConfig::load_or_create(&path),
            Err(ConfigError::InvalidDeviceId(_))
        ));
    }

    #[test]
    fn test_load_rejects_garbled_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is { not toml").unwrap();
        assert!(matches!(
            DaemonConfig::load_or_create(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = DaemonConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}

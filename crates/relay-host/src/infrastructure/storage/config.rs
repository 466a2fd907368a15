//! TOML-based configuration for the relay host.
//!
//! Reads and writes `HostConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\PromptRelay\host.toml`
//! - Linux:    `~/.config/prompt-relay/host.toml`
//! - macOS:    `~/Library/Application Support/PromptRelay/host.toml`
//!
//! A missing file is not an error: the host runs on defaults until the user
//! writes one (`relay-host init-config`).
//!
//! ```toml
//! [network]
//! bind_address = "0.0.0.0"
//! port = 24900
//!
//! [pairing]
//! code_length = 6
//! code_ttl_secs = 300
//!
//! [relay]
//! heartbeat_interval_secs = 10
//! resume_grace_secs = 60
//! ```
//!
//! Every field carries `#[serde(default = "...")]`, so a file that names only
//! one setting is complete, and an older file keeps working when new fields
//! are added.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_core::domain::pairing::{MAX_CODE_LEN, MIN_CODE_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::pairing::PairingSettings;
use crate::application::{RelaySettings, RouterSettings, ServiceSettings};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

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

    /// The config parsed but a value is unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level host configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Address the WebSocket listener binds.  `"0.0.0.0"` binds all
    /// interfaces, which the phone needs; `"127.0.0.1"` limits the host to
    /// local testing.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port, also embedded in the QR payload.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Pairing code issuance and brute-force guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingConfig {
    /// Digits per code, 4..=10.
    #[serde(default = "default_code_length")]
    pub code_length: usize,
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,
    /// How long a consumed code still recognises a retry from the same phone.
    #[serde(default = "default_consumed_retention_secs")]
    pub consumed_retention_secs: u64,
    /// How often expired codes are swept and a fresh code is issued.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

/// Channel timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_resume_grace_secs")]
    pub resume_grace_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Frames queued per connection before writers wait.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Reordering of inbound prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouterConfig {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,
    /// Furthest a prompt's seq may run ahead of the delivery mark.
    #[serde(default = "default_max_seq_ahead")]
    pub max_seq_ahead: u64,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    24900
}
fn default_code_length() -> usize {
    6
}
fn default_code_ttl_secs() -> u64 {
    300
}
fn default_consumed_retention_secs() -> u64 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    5
}
fn default_max_failed_attempts() -> u32 {
    5
}
fn default_lockout_secs() -> u64 {
    60
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_missed_heartbeats() -> u32 {
    3
}
fn default_resume_grace_secs() -> u64 {
    60
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_outbound_queue() -> usize {
    64
}
fn default_max_pending() -> usize {
    64
}
fn default_gap_timeout_ms() -> u64 {
    5_000
}
fn default_max_seq_ahead() -> u64 {
    1_024
}
fn default_inbox_capacity() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            code_length: default_code_length(),
            code_ttl_secs: default_code_ttl_secs(),
            consumed_retention_secs: default_consumed_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_failed_attempts: default_max_failed_attempts(),
            lockout_secs: default_lockout_secs(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_heartbeats: default_missed_heartbeats(),
            resume_grace_secs: default_resume_grace_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            gap_timeout_ms: default_gap_timeout_ms(),
            max_seq_ahead: default_max_seq_ahead(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Conversion and validation ─────────────────────────────────────────────────

impl HostConfig {
    /// Rejects values the host cannot run with.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&self.pairing.code_length) {
            return invalid(format!(
                "pairing.code_length must be within {MIN_CODE_LEN}..={MAX_CODE_LEN}, got {}",
                self.pairing.code_length
            ));
        }
        self.bind_addr()?;

        let nonzero = [
            ("pairing.code_ttl_secs", self.pairing.code_ttl_secs),
            ("pairing.sweep_interval_secs", self.pairing.sweep_interval_secs),
            ("pairing.max_failed_attempts", self.pairing.max_failed_attempts.into()),
            ("relay.heartbeat_interval_secs", self.relay.heartbeat_interval_secs),
            ("relay.missed_heartbeats", self.relay.missed_heartbeats.into()),
            ("relay.handshake_timeout_secs", self.relay.handshake_timeout_secs),
            ("relay.outbound_queue", self.relay.outbound_queue as u64),
            ("router.max_pending", self.router.max_pending as u64),
            ("router.gap_timeout_ms", self.router.gap_timeout_ms),
            ("router.max_seq_ahead", self.router.max_seq_ahead),
            ("router.inbox_capacity", self.router.inbox_capacity as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return invalid(format!("{name} must be greater than zero"));
        }
        Ok(())
    }

    /// The listener address.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if `network.bind_address` is not an IP
    /// address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.network.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "network.bind_address {:?} is not an IP address",
                self.network.bind_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pairing.sweep_interval_secs)
    }

    /// Builds the settings the relay service is constructed from.
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            pairing: PairingSettings {
                code_length: self.pairing.code_length,
                code_ttl: Duration::from_secs(self.pairing.code_ttl_secs),
                consumed_retention: Duration::from_secs(self.pairing.consumed_retention_secs),
                max_failed_attempts: self.pairing.max_failed_attempts,
                lockout: Duration::from_secs(self.pairing.lockout_secs),
            },
            relay: RelaySettings {
                heartbeat_interval: Duration::from_secs(self.relay.heartbeat_interval_secs),
                missed_heartbeats: self.relay.missed_heartbeats,
                resume_grace: Duration::from_secs(self.relay.resume_grace_secs),
                handshake_timeout: Duration::from_secs(self.relay.handshake_timeout_secs),
                outbound_queue: self.relay.outbound_queue,
            },
            router: RouterSettings {
                max_pending: self.router.max_pending,
                gap_timeout: Duration::from_millis(self.router.gap_timeout_ms),
                max_seq_ahead: self.router.max_seq_ahead,
            },
            inbox_capacity: self.router.inbox_capacity,
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("host.toml"))
}

/// Loads `HostConfig` from `path`, or from the default location when `path`
/// is `None`.  A file that does not exist yields `HostConfig::default()`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<HostConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HostConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &HostConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including the app subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("PromptRelay"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("prompt-relay"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("PromptRelay")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

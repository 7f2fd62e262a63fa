//! Sideband Configuration
//!
//! Ports, addresses and naming used when publishing and accepting sideband
//! channels, loadable from a TOML file at `~/.config/sideband/sideband.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [sideband]
//! socket_listen_address = "0.0.0.0"
//! socket_port = 50055
//! rdma_send_port = 50060
//! rdma_receive_port = 50061
//! rdma_timeout_ms = 5000
//! shared_memory_prefix = "TESTBUFFER_"
//! advertise_address = "10.0.0.12"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Effective Configuration
// =============================================================================

/// Default TCP port for the sockets strategy
pub const DEFAULT_SOCKET_PORT: u16 = 50055;

/// Default RDMA port for the listener's send-direction sessions
pub const DEFAULT_RDMA_SEND_PORT: u16 = 50060;

/// Default RDMA port for the listener's receive-direction sessions
pub const DEFAULT_RDMA_RECEIVE_PORT: u16 = 50061;

/// Configuration shared by every channel of a [`SidebandContext`](crate::SidebandContext)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidebandConfig {
    /// Address the socket listener binds
    pub socket_listen_address: String,

    /// Port the socket listener binds (0 = ephemeral)
    pub socket_port: u16,

    /// Port for send-direction RDMA sessions; clients connect their
    /// receive session here
    pub rdma_send_port: u16,

    /// Port for receive-direction RDMA sessions; clients connect their
    /// send session here
    pub rdma_receive_port: u16,

    /// Vendor timeout for RDMA operations in milliseconds (None = infinite)
    pub rdma_timeout_ms: Option<u64>,

    /// Number of in-flight buffer regions per RDMA session
    pub rdma_max_concurrent_transactions: usize,

    /// Prefix of shared-memory object names
    pub shared_memory_prefix: String,

    /// Usage id handed out to the first shared-memory channel
    pub shared_memory_base_id: String,

    /// Host published in connection addresses instead of the discovered one
    pub advertise_address: Option<String>,

    #[serde(skip)]
    pub(crate) source: Option<ConfigSource>,
}

impl Default for SidebandConfig {
    fn default() -> Self {
        Self {
            socket_listen_address: "0.0.0.0".to_string(),
            socket_port: DEFAULT_SOCKET_PORT,
            rdma_send_port: DEFAULT_RDMA_SEND_PORT,
            rdma_receive_port: DEFAULT_RDMA_RECEIVE_PORT,
            rdma_timeout_ms: None,
            rdma_max_concurrent_transactions: 2,
            shared_memory_prefix: "TESTBUFFER_".to_string(),
            shared_memory_base_id: "TestBuffer".to_string(),
            advertise_address: None,
            source: None,
        }
    }
}

impl SidebandConfig {
    /// Create configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared-memory name prefix
    #[must_use]
    pub fn with_shared_memory_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shared_memory_prefix = prefix.into();
        self
    }

    /// Set the socket listener address and port
    #[must_use]
    pub fn with_socket_listener(mut self, address: impl Into<String>, port: u16) -> Self {
        self.socket_listen_address = address.into();
        self.socket_port = port;
        self
    }

    /// Derive both RDMA ports from one base port (receive = base + 1)
    #[must_use]
    pub fn with_rdma_base_port(mut self, port: u16) -> Self {
        self.rdma_send_port = port;
        self.rdma_receive_port = port.wrapping_add(1);
        self
    }

    /// Set the advertised host
    #[must_use]
    pub fn with_advertise_address(mut self, address: impl Into<String>) -> Self {
        self.advertise_address = Some(address.into());
        self
    }

    /// RDMA vendor timeout (None = wait forever)
    #[must_use]
    pub fn rdma_timeout(&self) -> Option<Duration> {
        self.rdma_timeout_ms.map(Duration::from_millis)
    }

    /// Where the effective values came from
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source.unwrap_or(ConfigSource::Default)
    }

    /// Check invariants the transports rely on
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - The RDMA receive port is not the send port plus one
    /// - The shared-memory prefix is empty or contains `/`
    /// - Fewer than one concurrent RDMA transaction is configured
    pub fn validate(&self) -> Result<(), ConfigError> {
        // clients derive the receive port from the published send port
        if self.rdma_send_port.checked_add(1) != Some(self.rdma_receive_port) {
            return Err(ConfigError::ValidationError(format!(
                "rdma_receive_port must be rdma_send_port + 1 (got {} and {})",
                self.rdma_send_port, self.rdma_receive_port
            )));
        }
        if self.shared_memory_prefix.is_empty() || self.shared_memory_prefix.contains('/') {
            return Err(ConfigError::ValidationError(format!(
                "shared_memory_prefix {:?} must be non-empty and must not contain '/'",
                self.shared_memory_prefix
            )));
        }
        if self.shared_memory_base_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "shared_memory_base_id must be non-empty".to_string(),
            ));
        }
        if self.rdma_max_concurrent_transactions == 0 {
            return Err(ConfigError::ValidationError(
                "rdma_max_concurrent_transactions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Sideband section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SidebandToml {
    /// Socket listener address
    pub socket_listen_address: Option<String>,
    /// Socket listener port
    pub socket_port: Option<u16>,
    /// RDMA send-direction port
    pub rdma_send_port: Option<u16>,
    /// RDMA receive-direction port
    pub rdma_receive_port: Option<u16>,
    /// RDMA timeout in milliseconds (negative = infinite)
    pub rdma_timeout_ms: Option<i64>,
    /// In-flight regions per RDMA session
    pub rdma_max_concurrent_transactions: Option<usize>,
    /// Shared-memory name prefix
    pub shared_memory_prefix: Option<String>,
    /// First shared-memory usage id
    pub shared_memory_base_id: Option<String>,
    /// Published host
    pub advertise_address: Option<String>,
}

/// Root of the TOML configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigToml {
    /// `[sideband]` table
    pub sideband: SidebandToml,
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// `$XDG_CONFIG_HOME/sideband/sideband.toml`, typically
/// `~/.config/sideband/sideband.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("sideband").join("sideband.toml"))
}

/// Load configuration from the default path plus environment overrides
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the resulting values fail validation.
pub fn load_config() -> Result<SidebandConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from `path` (if it exists) plus environment overrides
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the resulting values fail validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SidebandConfig, ConfigError> {
    let mut config = SidebandConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConfigToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config.sideband);
            config.source = Some(ConfigSource::File);

            tracing::info!(
                path = %config_path.display(),
                "Loaded sideband configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut SidebandConfig, toml: &SidebandToml) {
    if let Some(ref address) = toml.socket_listen_address {
        config.socket_listen_address.clone_from(address);
    }
    if let Some(port) = toml.socket_port {
        config.socket_port = port;
    }
    if let Some(port) = toml.rdma_send_port {
        config.rdma_send_port = port;
    }
    if let Some(port) = toml.rdma_receive_port {
        config.rdma_receive_port = port;
    }
    if let Some(timeout) = toml.rdma_timeout_ms {
        config.rdma_timeout_ms = u64::try_from(timeout).ok();
    }
    if let Some(count) = toml.rdma_max_concurrent_transactions {
        config.rdma_max_concurrent_transactions = count;
    }
    if let Some(ref prefix) = toml.shared_memory_prefix {
        config.shared_memory_prefix.clone_from(prefix);
    }
    if let Some(ref base) = toml.shared_memory_base_id {
        config.shared_memory_base_id.clone_from(base);
    }
    if toml.advertise_address.is_some() {
        config.advertise_address.clone_from(&toml.advertise_address);
    }
}

fn apply_env_config(config: &mut SidebandConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(address) = lookup("SIDEBAND_SOCKET_ADDRESS") {
        config.socket_listen_address = address;
        config.source = Some(ConfigSource::Env);
    }
    if let Some(port) = lookup("SIDEBAND_SOCKET_PORT").and_then(|v| v.parse::<u16>().ok()) {
        config.socket_port = port;
        config.source = Some(ConfigSource::Env);
    }
    if let Some(port) = lookup("SIDEBAND_RDMA_PORT").and_then(|v| v.parse::<u16>().ok()) {
        config.rdma_send_port = port;
        config.rdma_receive_port = port.wrapping_add(1);
        config.source = Some(ConfigSource::Env);
    }
    if let Some(timeout) = lookup("SIDEBAND_RDMA_TIMEOUT_MS").and_then(|v| v.parse::<i64>().ok())
    {
        config.rdma_timeout_ms = u64::try_from(timeout).ok();
        config.source = Some(ConfigSource::Env);
    }
    if let Some(prefix) = lookup("SIDEBAND_SHM_PREFIX") {
        config.shared_memory_prefix = prefix;
        config.source = Some(ConfigSource::Env);
    }
    if let Some(address) = lookup("SIDEBAND_ADVERTISE_ADDRESS") {
        config.advertise_address = Some(address);
        config.source = Some(ConfigSource::Env);
    }
}

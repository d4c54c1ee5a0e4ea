//! Configuration types for wsrelay

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::network::MAX_CONNECTIONS;
use crate::relay::{DeadlinePolicy, RelayOptions, MAX_MESSAGE_SIZE, PONG_WAIT, WRITE_WAIT};
use crate::{RelayError, Result};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Deadline and heartbeat timings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// WebSocket upgrade settings
    #[serde(default)]
    pub upgrade: UpgradeConfig,
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Socket address to listen on
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Heartbeat configuration, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time allowed to write a single frame
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
    /// Maximum silence tolerated from the peer
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,
    /// Probe interval; defaults to 9/10 of `pong_wait_ms`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_period_ms: Option<u64>,
}

fn default_write_wait_ms() -> u64 {
    WRITE_WAIT.as_secs() * 1000
}

fn default_pong_wait_ms() -> u64 {
    PONG_WAIT.as_secs() * 1000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait_ms(),
            pong_wait_ms: default_pong_wait_ms(),
            ping_period_ms: None,
        }
    }
}

impl HeartbeatConfig {
    /// Deadline policy described by this configuration
    #[must_use]
    pub fn policy(&self) -> DeadlinePolicy {
        let write_wait = Duration::from_millis(self.write_wait_ms);
        let pong_wait = Duration::from_millis(self.pong_wait_ms);

        match self.ping_period_ms {
            Some(ms) => DeadlinePolicy {
                write_wait,
                pong_wait,
                ping_period: Duration::from_millis(ms),
            },
            None => DeadlinePolicy::from_pong_wait(pong_wait, write_wait),
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound payload size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_message_size() -> usize {
    MAX_MESSAGE_SIZE
}

fn default_max_connections() -> usize {
    MAX_CONNECTIONS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_connections: default_max_connections(),
        }
    }
}

/// WebSocket upgrade settings, applied to every accepted transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Outgoing bytes buffered before a flush
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    /// Hard cap on buffered outgoing bytes
    #[serde(default = "default_max_write_buffer_size")]
    pub max_write_buffer_size: usize,
}

fn default_write_buffer_size() -> usize {
    1024
}

fn default_max_write_buffer_size() -> usize {
    64 * 1024
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: default_write_buffer_size(),
            max_write_buffer_size: default_max_write_buffer_size(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| RelayError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        self.heartbeat.policy().validate()?;

        if self.limits.max_message_size == 0 {
            return Err(RelayError::ConfigError(
                "max_message_size must be > 0".to_string(),
            ));
        }

        if self.limits.max_connections == 0 {
            return Err(RelayError::ConfigError(
                "max_connections must be > 0".to_string(),
            ));
        }

        if self.upgrade.max_write_buffer_size <= self.upgrade.write_buffer_size {
            return Err(RelayError::ConfigError(format!(
                "max_write_buffer_size ({}) must exceed write_buffer_size ({})",
                self.upgrade.max_write_buffer_size, self.upgrade.write_buffer_size
            )));
        }

        Ok(())
    }

    /// Settings handed to every connection's relay loops
    #[must_use]
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            policy: self.heartbeat.policy(),
            max_message_size: self.limits.max_message_size,
        }
    }

    /// Transport configuration used by the upgrade handshake
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = self.relay_options().websocket_config();
        config.write_buffer_size = self.upgrade.write_buffer_size;
        config.max_write_buffer_size = self.upgrade.max_write_buffer_size;
        config
    }
}

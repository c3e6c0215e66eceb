//! # Configuration Management
//!
//! Centralized configuration for the relay and its peers.
//!
//! This module provides structured configuration for the relay process and
//! for connecting clients: identity, authentication, routing policy,
//! reconnection, outbound queuing and conversation deadlines.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! Durations are expressed in milliseconds in every serialized form.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: i32 = 1;

/// Max allowed frame payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Peer id the relay uses for envelopes it originates
pub const DEFAULT_RELAY_ID: &str = "relay";

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Relay-specific configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEER_RELAY_SERVER_ADDRESS") {
            config.client.server_address = addr.clone();
            config.relay.bind_address = addr;
        }

        if let Ok(port) = std::env::var("PEER_RELAY_SERVER_PORT") {
            let port = port
                .parse::<u16>()
                .map_err(|e| ProtocolError::ConfigError(format!("Invalid port '{port}': {e}")))?;
            config.client.server_port = port;
            config.relay.port = port;
        }

        if let Ok(token) = std::env::var("PEER_RELAY_AUTH_TOKEN") {
            config.client.authentication_token = token.clone();
            config.relay.authentication_token = token;
        }

        if let Ok(id) = std::env::var("PEER_RELAY_UNIQUE_ID") {
            config.client.unique_id = id;
        }

        if let Ok(group) = std::env::var("PEER_RELAY_GROUP") {
            config.client.group = group;
        }

        if let Ok(timeout) = std::env::var("PEER_RELAY_CONVERSATION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.conversation_timeout = Duration::from_millis(val);
                config.relay.conversation_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.relay.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Relay-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Interface the relay listens on
    pub bind_address: String,

    /// Port the relay listens on (0 picks an ephemeral port)
    pub port: u16,

    /// Peer id the relay uses as `source` for envelopes it originates
    pub unique_id: String,

    /// Shared secret every peer must present at handshake
    pub authentication_token: String,

    /// Accept frames whose protocol version differs instead of dropping them
    pub allow_version_mismatch: bool,

    /// Whether peers may address themselves
    pub allow_self_forward: bool,

    /// Default deadline for conversations the relay starts
    #[serde(with = "duration_serde")]
    pub conversation_timeout: Duration,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Timeout for graceful relay shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("127.0.0.1"),
            port: 9000,
            unique_id: String::from(DEFAULT_RELAY_ID),
            authentication_token: String::from("change-me"),
            allow_version_mismatch: false,
            allow_self_forward: false,
            conversation_timeout: timeout::DEFAULT_CONVERSATION_TIMEOUT,
            max_connections: 1000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl RelayConfig {
    /// Socket address string the relay binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Validate relay configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("Relay bind address cannot be empty".to_string());
        } else if self
            .listen_address()
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            errors.push(format!(
                "Invalid relay bind address: '{}' (expected an IP address such as '0.0.0.0')",
                self.bind_address
            ));
        }

        if self.unique_id.is_empty() {
            errors.push("Relay unique id cannot be empty".to_string());
        }

        if self.authentication_token.is_empty() {
            errors.push("Relay authentication token cannot be empty".to_string());
        }

        if self.conversation_timeout.as_millis() < 10 {
            errors.push("Conversation timeout too short (minimum: 10ms)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay host to dial
    pub server_address: String,

    /// Relay port to dial
    pub server_port: u16,

    /// This peer's identity
    pub unique_id: String,

    /// This peer's routing group
    pub group: String,

    /// Shared secret presented at handshake
    pub authentication_token: String,

    /// Accept frames whose protocol version differs instead of dropping them
    pub allow_version_mismatch: bool,

    /// Whether to automatically reconnect on connection loss
    pub auto_reconnect: bool,

    /// Delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_interval: Duration,

    /// Whether to buffer outbound sends while disconnected
    pub queue_messages: bool,

    /// How long a buffered send stays deliverable
    #[serde(with = "duration_serde")]
    pub queued_message_timeout: Duration,

    /// Default deadline for conversations without an explicit timeout
    #[serde(with = "duration_serde")]
    pub conversation_timeout: Duration,

    /// How long to wait for the relay's handshake result
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: String::from("127.0.0.1"),
            server_port: 9000,
            unique_id: String::from("peer"),
            group: String::from("default"),
            authentication_token: String::from("change-me"),
            allow_version_mismatch: false,
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(1),
            queue_messages: true,
            queued_message_timeout: Duration::from_secs(30),
            conversation_timeout: timeout::DEFAULT_CONVERSATION_TIMEOUT,
            handshake_timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Socket address string the client dials
    pub fn relay_address(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server_address.is_empty() {
            errors.push("Client server address cannot be empty".to_string());
        }

        if self.server_port == 0 {
            errors.push("Client server port must be greater than 0".to_string());
        }

        if self.unique_id.is_empty() {
            errors.push("Client unique id cannot be empty".to_string());
        }

        if self.group.is_empty() {
            errors.push("Client group cannot be empty".to_string());
        }

        if self.authentication_token.is_empty() {
            errors.push("Client authentication token cannot be empty".to_string());
        }

        if self.conversation_timeout.as_millis() < 10 {
            errors.push("Conversation timeout too short (minimum: 10ms)".to_string());
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        }

        if self.reconnect_interval.as_millis() < 10 {
            errors.push("Reconnect interval too short (minimum: 10ms)".to_string());
        } else if self.reconnect_interval.as_secs() > 300 {
            errors.push("Reconnect interval too long (maximum: 300s)".to_string());
        }

        if self.queue_messages && self.queued_message_timeout.is_zero() {
            errors.push(
                "Queued message timeout must be greater than 0 when queue_messages is enabled"
                    .to_string(),
            );
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum allowed frame payload size in bytes
    pub max_payload_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > i32::MAX as usize {
            errors.push(format!(
                "Max payload size too large: {} bytes (frame lengths are 32-bit signed)",
                self.max_payload_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Whether to include the event target in log lines
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peer-relay"),
            log_level: Level::INFO,
            json_format: false,
            show_target: true,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

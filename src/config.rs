use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::logging::{LoggingConfig, LOG_FORMATS};
use crate::protocol::constants::{
    DEFAULT_INITIAL_DELAYED_ACK_BYTES, MAX_PAYLOAD, MAX_PAYLOAD_LIMIT, VERSION, VERSION_MIN,
};
use crate::protocol::features::{default_features, DELAYED_ACK};

/// Client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// CNXN negotiation parameters
    pub handshake: HandshakeConfig,

    /// Packet dispatcher settings
    pub dispatcher: DispatcherConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Parameters proposed to the device in the CNXN packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Protocol version to propose
    pub version: u32,

    /// Maximum payload size to propose
    pub max_payload_size: u32,

    /// Features advertised in the host banner
    pub features: Vec<String>,

    /// Receive budget per socket when delayed ack is negotiated; 0 disables it
    pub initial_delayed_ack_bytes: u32,

    /// Give up if the device has not completed the handshake in time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            version: VERSION,
            max_payload_size: MAX_PAYLOAD,
            features: default_features(),
            initial_delayed_ack_bytes: DEFAULT_INITIAL_DELAYED_ACK_BYTES,
            timeout_ms: None,
        }
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Features to advertise: `delayed_ack` is dropped when no budget is set.
    pub fn effective_features(&self) -> Vec<String> {
        self.features
            .iter()
            .filter(|f| self.initial_delayed_ack_bytes > 0 || f.as_str() != DELAYED_ACK)
            .cloned()
            .collect()
    }
}

/// Packet dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Tear the connection down when no packet arrives within this limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_time_limit_ms: Option<u64>,

    /// Packets buffered between the reader task and the dispatcher
    pub packet_queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            read_time_limit_ms: None,
            packet_queue_depth: 16,
        }
    }
}

impl DispatcherConfig {
    pub fn read_time_limit(&self) -> Option<Duration> {
        self.read_time_limit_ms.map(Duration::from_millis)
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: ClientConfig =
            toml::from_str(&content).context("Failed to parse TOML configuration")?;

        config
            .validate()
            .context("Configuration validation failed")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        std::fs::write(path, content)
            .context(format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let handshake = &self.handshake;
        if handshake.version < VERSION_MIN {
            return Err(anyhow::anyhow!(
                "Protocol version 0x{:08x} is older than 0x{:08x}",
                handshake.version,
                VERSION_MIN
            ));
        }

        if handshake.max_payload_size == 0 || handshake.max_payload_size > MAX_PAYLOAD_LIMIT {
            return Err(anyhow::anyhow!(
                "max_payload_size must be between 1 and {}",
                MAX_PAYLOAD_LIMIT
            ));
        }

        if handshake.timeout_ms == Some(0) {
            return Err(anyhow::anyhow!("handshake timeout must be greater than 0"));
        }

        if self.dispatcher.read_time_limit_ms == Some(0) {
            return Err(anyhow::anyhow!("read_time_limit must be greater than 0"));
        }

        if self.dispatcher.packet_queue_depth == 0 {
            return Err(anyhow::anyhow!("packet_queue_depth must be greater than 0"));
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!("Invalid log format: {}", self.logging.format));
        }

        Ok(())
    }

    /// Override configuration with environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("ADBD_CLIENT_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(size) = std::env::var("ADBD_CLIENT_MAX_PAYLOAD") {
            if let Ok(size) = size.parse() {
                self.handshake.max_payload_size = size;
            }
        }

        if let Ok(bytes) = std::env::var("ADBD_CLIENT_DELAYED_ACK_BYTES") {
            if let Ok(bytes) = bytes.parse() {
                self.handshake.initial_delayed_ack_bytes = bytes;
            }
        }

        if let Ok(limit) = std::env::var("ADBD_CLIENT_READ_TIME_LIMIT_MS") {
            if let Ok(limit) = limit.parse() {
                self.dispatcher.read_time_limit_ms = Some(limit);
            }
        }
    }
}

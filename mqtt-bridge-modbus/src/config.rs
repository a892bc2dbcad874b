//! Configuration for the Modbus bridge.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use mqtt_bridge_common::LoggingConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// MQTT broker settings
    pub mqtt: MqttConfig,

    /// Modbus device settings
    pub modbus: ModbusConfig,

    /// Poll cycle settings
    #[serde(default)]
    pub bridge: PollConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker address (IP or hostname)
    pub host: String,

    /// Broker port (default: 1883)
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Topic to publish readings on
    pub topic: String,

    /// Client identifier (default: derived from the process id)
    #[serde(default)]
    pub client_id: Option<String>,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

/// Modbus device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Device address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Starting address of the input registers to read
    #[serde(default = "default_address")]
    pub address: u16,

    /// Number of registers to read
    #[serde(default = "default_count")]
    pub count: u16,

    /// Connection timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_address() -> u16 {
    1
}

fn default_count() -> u16 {
    2
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Poll cycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between poll cycles in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Backoff between failed connection attempts in seconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_retry_backoff() -> u64 {
    5
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Validation(
                "MQTT broker host cannot be empty".to_string(),
            ));
        }

        if self.mqtt.topic.is_empty() {
            return Err(ConfigError::Validation(
                "MQTT topic cannot be empty".to_string(),
            ));
        }

        if self.modbus.host.is_empty() {
            return Err(ConfigError::Validation(
                "Modbus device host cannot be empty".to_string(),
            ));
        }

        if self.modbus.unit_id == 0 {
            return Err(ConfigError::Validation(
                "Modbus unit_id must be 1-247".to_string(),
            ));
        }

        if self.modbus.count == 0 {
            return Err(ConfigError::Validation(
                "Modbus register count must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

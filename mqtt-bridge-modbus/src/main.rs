//! MQTT bridge for Modbus TCP devices.
//!
//! Polls input registers from a Modbus TCP device on a fixed interval and
//! republishes each reading as JSON on an MQTT topic.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use mqtt_bridge_common::LoggingConfig;
use mqtt_bridge_modbus::bridge::BridgeLoop;
use mqtt_bridge_modbus::config::BridgeConfig;
use mqtt_bridge_modbus::modbus::ModbusLink;
use mqtt_bridge_modbus::mqtt::MqttLink;

/// MQTT bridge for Modbus TCP devices.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-modbus")]
#[command(about = "Polls a Modbus TCP device and publishes readings to MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "bridge.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    mqtt_bridge_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting mqtt-bridge-modbus");
    info!("Loaded configuration from {:?}", args.config);

    let backoff = Duration::from_secs(config.bridge.retry_backoff_secs);

    // Initial connections block until each side is up.
    info!(
        "Connecting to Modbus device at {}:{}...",
        config.modbus.host, config.modbus.port
    );
    let modbus = ModbusLink::connect(&config.modbus, backoff).await;

    info!(
        "Connecting to MQTT broker at {}:{}...",
        config.mqtt.host, config.mqtt.port
    );
    let mqtt = MqttLink::connect(&config.mqtt, backoff).await;

    let mut bridge = BridgeLoop::new(
        modbus,
        mqtt,
        config.modbus.address,
        config.modbus.count,
        Duration::from_secs(config.bridge.poll_interval_secs),
    );

    info!(
        "Bridge running (topic: {}, interval: {}s)",
        config.mqtt.topic, config.bridge.poll_interval_secs
    );

    // Poll until interrupted, then run the single cleanup path.
    tokio::select! {
        _ = bridge.run() => {}
        result = signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
        }
    }

    bridge.shutdown().await;

    Ok(())
}

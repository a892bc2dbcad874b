//! Modbus TCP link with caller-driven reconnection.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::bridge::RegisterSource;
use crate::config::ModbusConfig;

/// Error type for register reads.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Device exception: {0}")]
    Exception(String),
    #[error("Link is closed")]
    Closed,
}

/// A single connection to a Modbus TCP device.
///
/// The link does not heal itself. When a read fails the caller is expected
/// to `close()` it and obtain a fresh connection via `reconnect()`.
pub struct ModbusLink {
    endpoint: String,
    slave: Slave,
    connect_timeout: Duration,
    backoff: Duration,
    ctx: Option<Context>,
}

impl ModbusLink {
    /// Connect to the device, retrying with a fixed backoff until a
    /// connection is established.
    pub async fn connect(config: &ModbusConfig, backoff: Duration) -> Self {
        let endpoint = format!("{}:{}", config.host, config.port);
        let slave = Slave(config.unit_id);
        let connect_timeout = Duration::from_millis(config.timeout_ms);

        let ctx = establish(&endpoint, slave, connect_timeout, backoff).await;

        Self {
            endpoint,
            slave,
            connect_timeout,
            backoff,
            ctx: Some(ctx),
        }
    }

    /// Read `count` input registers starting at `address`.
    ///
    /// Fails when the transport reports an error, the device returns an
    /// exception response, or the link has been closed. A successful read
    /// yields exactly `count` values.
    pub async fn read(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        let ctx = self.ctx.as_mut().ok_or(ReadError::Closed)?;

        let values = ctx
            .read_input_registers(address, count)
            .await
            .map_err(|e| ReadError::Transport(e.to_string()))?
            .map_err(|e| ReadError::Exception(format!("{:?}", e)))?;

        Ok(values)
    }

    /// Release the transport. Safe to call on an already-closed link.
    pub async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.disconnect().await {
                debug!("Error closing Modbus connection: {}", e);
            }
        }
    }

    /// Drop the current connection, if any, and block until a new one is
    /// established.
    pub async fn reconnect(&mut self) {
        self.close().await;
        self.ctx = Some(establish(&self.endpoint, self.slave, self.connect_timeout, self.backoff).await);
    }
}

impl RegisterSource for ModbusLink {
    async fn read(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ReadError> {
        ModbusLink::read(self, address, count).await
    }

    async fn close(&mut self) {
        ModbusLink::close(self).await;
    }

    async fn reconnect(&mut self) {
        ModbusLink::reconnect(self).await;
    }
}

/// Keep attempting a connection until one succeeds.
async fn establish(
    endpoint: &str,
    slave: Slave,
    connect_timeout: Duration,
    backoff: Duration,
) -> Context {
    loop {
        match try_connect(endpoint, slave, connect_timeout).await {
            Ok(ctx) => {
                info!("Connected to Modbus device at {}", endpoint);
                return ctx;
            }
            Err(e) => {
                warn!(
                    "Failed to connect to Modbus device at {}: {}; retrying in {}s",
                    endpoint,
                    e,
                    backoff.as_secs()
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// A single connection attempt, bounded by the configured timeout.
async fn try_connect(
    endpoint: &str,
    slave: Slave,
    connect_timeout: Duration,
) -> io::Result<Context> {
    let addr = tokio::net::lookup_host(endpoint)
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "endpoint resolved to no address")
        })?;

    let ctx = tokio::time::timeout(connect_timeout, tcp::connect_slave(addr, slave))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timeout"))?
        .map_err(io::Error::other)?;

    Ok(ctx)
}

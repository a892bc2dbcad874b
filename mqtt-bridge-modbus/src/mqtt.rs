//! MQTT link with a background network loop and automatic reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::ReadingSink;
use crate::config::MqttConfig;

/// How long `disconnect` waits for the network loop to drain before
/// aborting it.
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Error type for publish attempts.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Client error: {0}")]
    Client(String),
}

/// A connection to the MQTT broker.
///
/// Network I/O (keepalive, acks, disconnect detection) runs on a background
/// task that also owns reconnection: when the transport drops, the task
/// keeps retrying with a fixed backoff until the broker accepts a new
/// session. `publish` never waits for that recovery; while the link is down
/// it fails fast and the message is dropped.
pub struct MqttLink {
    client: AsyncClient,
    topic: String,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MqttLink {
    /// Connect to the broker, retrying with a fixed backoff until the
    /// initial session is accepted, then start the background network loop.
    pub async fn connect(config: &MqttConfig, backoff: Duration) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-bridge-modbus-{}", std::process::id()));

        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        // Block until the broker accepts the initial session.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(
                        "Connected to MQTT broker at {}:{}",
                        config.host, config.port
                    );
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Failed to connect to MQTT broker: {}; retrying in {}s",
                        e,
                        backoff.as_secs()
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        let connected = Arc::new(AtomicBool::new(true));
        let running = Arc::new(AtomicBool::new(true));

        let worker = tokio::spawn(drive(
            eventloop,
            connected.clone(),
            running.clone(),
            backoff,
        ));

        Self {
            client,
            topic: config.topic.clone(),
            connected,
            running,
            worker: Some(worker),
        }
    }

    /// Whether the broker session is currently up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Publish a message body on the configured topic.
    ///
    /// A single attempt is made: while the link is down the call fails with
    /// [`PublishError::NotConnected`] and the message is dropped.
    pub async fn publish(&self, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        self.client
            .publish(&self.topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| PublishError::Client(e.to_string()))
    }

    /// Stop the background network loop and close the transport.
    /// Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);

        if let Err(e) = self.client.disconnect().await {
            debug!("Error disconnecting MQTT client: {}", e);
        }

        // Let the loop flush the DISCONNECT, then stop it for good. The
        // loop may be sleeping out a reconnect backoff, so don't wait for
        // the full delay.
        if let Some(mut worker) = self.worker.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut worker)
                .await
                .is_err()
            {
                worker.abort();
            }
        }

        info!("Disconnected from MQTT broker");
    }
}

impl ReadingSink for MqttLink {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), PublishError> {
        MqttLink::publish(self, payload).await
    }

    async fn disconnect(&mut self) {
        MqttLink::disconnect(self).await;
    }
}

/// Run the network loop: keepalive, incoming acks, and reconnection.
///
/// `rumqttc` re-attempts the connection on the next `poll` after an error,
/// so sleeping between failed polls yields the fixed-backoff reconnect
/// loop. The `connected` flag is the only state shared with publishers.
async fn drive(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    backoff: Duration,
) {
    while running.load(Ordering::SeqCst) {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::SeqCst);
                info!("Reconnected to MQTT broker");
            }
            Ok(event) => {
                debug!("MQTT event: {:?}", event);
            }
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if connected.swap(false, Ordering::SeqCst) {
                    warn!(
                        "MQTT connection lost: {}; reconnecting in {}s",
                        e,
                        backoff.as_secs()
                    );
                } else {
                    warn!(
                        "MQTT reconnect failed: {}; retrying in {}s",
                        e,
                        backoff.as_secs()
                    );
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

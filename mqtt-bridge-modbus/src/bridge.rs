//! The poll/publish cycle connecting the Modbus and MQTT links.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use mqtt_bridge_common::Reading;

use crate::modbus::ReadError;
use crate::mqtt::PublishError;

/// Source of register values, with caller-driven reconnection.
#[allow(async_fn_in_trait)]
pub trait RegisterSource {
    /// Read `count` registers starting at `address`.
    async fn read(&mut self, address: u16, count: u16) -> Result<Vec<u16>, ReadError>;

    /// Release the transport. Safe to call more than once.
    async fn close(&mut self);

    /// Block until a fresh connection is established.
    async fn reconnect(&mut self);
}

/// Destination for serialized readings.
#[allow(async_fn_in_trait)]
pub trait ReadingSink {
    /// Publish a message body. A single attempt, no redelivery.
    async fn publish(&self, payload: Vec<u8>) -> Result<(), PublishError>;

    /// Stop background activity and close the transport.
    /// Safe to call more than once.
    async fn disconnect(&mut self);
}

/// Observable bridge states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Reading registers on the poll interval.
    Polling,
    /// Re-establishing the Modbus connection after a failed read.
    ModbusRecovering,
    /// Shut down; both links are closed.
    Terminated,
}

/// The poll loop: read registers, publish a reading, sleep, repeat.
///
/// Modbus failures are handled here, by replacing the connection before the
/// next tick. MQTT failures are not: the sink recovers on its own, and a
/// publish that fails while it is down is logged and dropped.
pub struct BridgeLoop<S, P> {
    source: S,
    sink: P,
    address: u16,
    count: u16,
    poll_interval: Duration,
    state: BridgeState,
}

impl<S: RegisterSource, P: ReadingSink> BridgeLoop<S, P> {
    /// Create a bridge over two connected links.
    pub fn new(source: S, sink: P, address: u16, count: u16, poll_interval: Duration) -> Self {
        Self {
            source,
            sink,
            address,
            count,
            poll_interval,
            state: BridgeState::Polling,
        }
    }

    /// The current bridge state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Run poll cycles until cancelled.
    ///
    /// Every cycle ends with the fixed inter-poll wait, regardless of
    /// outcome.
    pub async fn run(&mut self) {
        loop {
            self.tick().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One poll cycle.
    ///
    /// A failed read replaces the Modbus connection before returning; a
    /// short batch or a failed publish only logs.
    pub async fn tick(&mut self) {
        match self.source.read(self.address, self.count).await {
            Ok(registers) => match Reading::from_registers(&registers) {
                Some(reading) => self.forward(reading).await,
                None => {
                    warn!(
                        "Not enough data from Modbus device ({} registers); skipping publish",
                        registers.len()
                    );
                }
            },
            Err(e) => {
                error!("Failed to read input registers: {}; reconnecting to Modbus device", e);
                self.source.close().await;
                self.state = BridgeState::ModbusRecovering;
                self.source.reconnect().await;
                self.state = BridgeState::Polling;
            }
        }
    }

    /// Serialize and publish one reading.
    async fn forward(&mut self, reading: Reading) {
        let payload = match reading.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode reading: {}", e);
                return;
            }
        };

        match self.sink.publish(payload).await {
            Ok(()) => debug!("Published reading: {:?}", reading),
            Err(e) => warn!("Failed to publish reading: {}; message dropped", e),
        }
    }

    /// Close both links and enter the terminal state.
    ///
    /// Subsequent calls are no-ops, so the links are closed exactly once
    /// through here no matter how shutdown is reached.
    pub async fn shutdown(&mut self) {
        if self.state == BridgeState::Terminated {
            return;
        }

        self.sink.disconnect().await;
        self.source.close().await;
        self.state = BridgeState::Terminated;

        info!("Bridge stopped, connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Calls observed on the mock links, in order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Read,
        Close,
        Reconnect,
        Publish,
        Disconnect,
    }

    type Journal = Arc<Mutex<Vec<Call>>>;

    struct ScriptedSource {
        script: VecDeque<Result<Vec<u16>, ReadError>>,
        journal: Journal,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<u16>, ReadError>>, journal: Journal) -> Self {
            Self {
                script: script.into(),
                journal,
            }
        }
    }

    impl RegisterSource for ScriptedSource {
        async fn read(&mut self, _address: u16, _count: u16) -> Result<Vec<u16>, ReadError> {
            self.journal.lock().unwrap().push(Call::Read);
            self.script.pop_front().unwrap_or(Ok(vec![0, 0]))
        }

        async fn close(&mut self) {
            self.journal.lock().unwrap().push(Call::Close);
        }

        async fn reconnect(&mut self) {
            self.journal.lock().unwrap().push(Call::Reconnect);
        }
    }

    /// A source whose reconnect never completes, for cancellation tests.
    struct StuckSource {
        journal: Journal,
    }

    impl RegisterSource for StuckSource {
        async fn read(&mut self, _address: u16, _count: u16) -> Result<Vec<u16>, ReadError> {
            self.journal.lock().unwrap().push(Call::Read);
            Err(ReadError::Transport("broken pipe".to_string()))
        }

        async fn close(&mut self) {
            self.journal.lock().unwrap().push(Call::Close);
        }

        async fn reconnect(&mut self) {
            self.journal.lock().unwrap().push(Call::Reconnect);
            std::future::pending::<()>().await;
        }
    }

    struct RecordingSink {
        payloads: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
        journal: Journal,
    }

    impl RecordingSink {
        fn new(journal: Journal) -> Self {
            Self {
                payloads: Arc::new(Mutex::new(Vec::new())),
                fail: false,
                journal,
            }
        }

        fn failing(journal: Journal) -> Self {
            Self {
                fail: true,
                ..Self::new(journal)
            }
        }
    }

    impl ReadingSink for RecordingSink {
        async fn publish(&self, payload: Vec<u8>) -> Result<(), PublishError> {
            self.journal.lock().unwrap().push(Call::Publish);
            if self.fail {
                return Err(PublishError::NotConnected);
            }
            self.payloads.lock().unwrap().push(payload);
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.journal.lock().unwrap().push(Call::Disconnect);
        }
    }

    fn count_calls(journal: &Journal, call: Call) -> usize {
        journal.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    fn decoded_payloads(sink_payloads: &Arc<Mutex<Vec<Vec<u8>>>>) -> Vec<serde_json::Value> {
        sink_payloads
            .lock()
            .unwrap()
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn successful_read_publishes_first_two_registers() {
        let journal: Journal = Default::default();
        let source = ScriptedSource::new(vec![Ok(vec![22, 55])], journal.clone());
        let sink = RecordingSink::new(journal.clone());
        let payloads = sink.payloads.clone();

        let mut bridge = BridgeLoop::new(source, sink, 1, 2, Duration::ZERO);
        bridge.tick().await;

        let decoded = decoded_payloads(&payloads);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0]["temperature"], 22);
        assert_eq!(decoded[0]["humidity"], 55);
        assert!(decoded[0]["time"].is_string());
        assert_eq!(bridge.state(), BridgeState::Polling);
    }

    #[tokio::test]
    async fn read_error_closes_then_reconnects_before_next_read() {
        let journal: Journal = Default::default();
        let source = ScriptedSource::new(
            vec![
                Err(ReadError::Transport("connection reset".to_string())),
                Ok(vec![1, 2]),
            ],
            journal.clone(),
        );
        let sink = RecordingSink::new(journal.clone());

        let mut bridge = BridgeLoop::new(source, sink, 1, 2, Duration::ZERO);
        bridge.tick().await;
        bridge.tick().await;

        let calls = journal.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                Call::Read,
                Call::Close,
                Call::Reconnect,
                Call::Read,
                Call::Publish,
            ]
        );
        assert_eq!(bridge.state(), BridgeState::Polling);
    }

    #[tokio::test]
    async fn short_batch_skips_publish_without_reconnect() {
        let journal: Journal = Default::default();
        let source = ScriptedSource::new(vec![Ok(vec![7])], journal.clone());
        let sink = RecordingSink::new(journal.clone());
        let payloads = sink.payloads.clone();

        let mut bridge = BridgeLoop::new(source, sink, 1, 2, Duration::ZERO);
        bridge.tick().await;

        assert!(payloads.lock().unwrap().is_empty());
        assert_eq!(count_calls(&journal, Call::Publish), 0);
        assert_eq!(count_calls(&journal, Call::Close), 0);
        assert_eq!(count_calls(&journal, Call::Reconnect), 0);
        assert_eq!(bridge.state(), BridgeState::Polling);
    }

    #[tokio::test]
    async fn publish_failure_leaves_modbus_link_alone() {
        let journal: Journal = Default::default();
        let source = ScriptedSource::new(vec![Ok(vec![10, 20])], journal.clone());
        let sink = RecordingSink::failing(journal.clone());

        let mut bridge = BridgeLoop::new(source, sink, 1, 2, Duration::ZERO);
        bridge.tick().await;

        assert_eq!(count_calls(&journal, Call::Publish), 1);
        assert_eq!(count_calls(&journal, Call::Close), 0);
        assert_eq!(count_calls(&journal, Call::Reconnect), 0);
        assert_eq!(bridge.state(), BridgeState::Polling);
    }

    #[tokio::test]
    async fn recovery_scenario_publishes_around_one_reconnect() {
        // reads: [22,55], error, [23,54] -> two publishes, one reconnect
        let journal: Journal = Default::default();
        let source = ScriptedSource::new(
            vec![
                Ok(vec![22, 55]),
                Err(ReadError::Transport("broken pipe".to_string())),
                Ok(vec![23, 54]),
            ],
            journal.clone(),
        );
        let sink = RecordingSink::new(journal.clone());
        let payloads = sink.payloads.clone();

        let mut bridge = BridgeLoop::new(source, sink, 1, 2, Duration::ZERO);
        for _ in 0..3 {
            bridge.tick().await;
        }

        let decoded = decoded_payloads(&payloads);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0]["temperature"], 22);
        assert_eq!(decoded[0]["humidity"], 55);
        assert_eq!(decoded[1]["temperature"], 23);
        assert_eq!(decoded[1]["humidity"], 54);
        assert_eq!(count_calls(&journal, Call::Close), 1);
        assert_eq!(count_calls(&journal, Call::Reconnect), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_both_links_exactly_once() {
        let journal: Journal = Default::default();
        let source = ScriptedSource::new(vec![], journal.clone());
        let sink = RecordingSink::new(journal.clone());

        let mut bridge = BridgeLoop::new(source, sink, 1, 2, Duration::ZERO);
        bridge.shutdown().await;
        bridge.shutdown().await;

        assert_eq!(count_calls(&journal, Call::Disconnect), 1);
        assert_eq!(count_calls(&journal, Call::Close), 1);
        assert_eq!(bridge.state(), BridgeState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reachable_while_modbus_recovering() {
        let journal: Journal = Default::default();
        let source = StuckSource {
            journal: journal.clone(),
        };
        let sink = RecordingSink::new(journal.clone());

        let mut bridge = BridgeLoop::new(source, sink, 1, 2, Duration::ZERO);

        // The first tick fails its read and blocks inside reconnect; the
        // interrupt arrives while the bridge is mid-recovery.
        tokio::select! {
            _ = bridge.run() => unreachable!("run never returns on its own"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        assert_eq!(bridge.state(), BridgeState::ModbusRecovering);

        bridge.shutdown().await;

        assert_eq!(count_calls(&journal, Call::Disconnect), 1);
        assert_eq!(bridge.state(), BridgeState::Terminated);

        // One close from the failed-read path, one from cleanup; the link
        // itself treats the second as a no-op.
        assert_eq!(count_calls(&journal, Call::Close), 2);
        assert_eq!(count_calls(&journal, Call::Reconnect), 1);
    }
}

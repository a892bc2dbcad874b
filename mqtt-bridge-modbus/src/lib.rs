//! MQTT bridge for Modbus TCP devices.
//!
//! The bridge owns two independent connections with independent recovery:
//!
//! - [`modbus::ModbusLink`] fails a read synchronously; the poll loop
//!   replaces it with a freshly connected link before the next tick.
//! - [`mqtt::MqttLink`] detects disconnects on its background network
//!   loop and reconnects there, without involving the poll loop.
//!
//! [`bridge::BridgeLoop`] ties the two together: read input registers,
//! build a reading, publish it, wait out the poll interval, repeat. Either
//! side can go down and come back without the other noticing.

pub mod bridge;
pub mod config;
pub mod modbus;
pub mod mqtt;

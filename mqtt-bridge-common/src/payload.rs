use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timestamp format used in outgoing payloads.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single sensor reading published to the broker.
///
/// Built from one batch of raw register values: the first register is the
/// temperature, the second the humidity. The timestamp is taken from the
/// local process clock when the reading is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Raw temperature register value.
    pub temperature: u16,

    /// Raw humidity register value.
    pub humidity: u16,

    /// Capture time, formatted `YYYY-MM-DD HH:MM:SS`.
    pub time: String,
}

impl Reading {
    /// Build a reading from a batch of raw register values.
    ///
    /// Returns `None` when the batch holds fewer than two registers.
    /// Registers beyond the first two are ignored.
    pub fn from_registers(registers: &[u16]) -> Option<Self> {
        if registers.len() < 2 {
            return None;
        }

        Some(Self {
            temperature: registers[0],
            humidity: registers[1],
            time: local_timestamp(),
        })
    }

    /// Encode the reading as a JSON message body.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Current local time formatted for payloads.
pub fn local_timestamp() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_registers() {
        let reading = Reading::from_registers(&[22, 55]).unwrap();

        assert_eq!(reading.temperature, 22);
        assert_eq!(reading.humidity, 55);
        assert!(!reading.time.is_empty());
    }

    #[test]
    fn test_short_batch_yields_none() {
        assert_eq!(Reading::from_registers(&[]), None);
        assert_eq!(Reading::from_registers(&[7]), None);
    }

    #[test]
    fn test_extra_registers_ignored() {
        let reading = Reading::from_registers(&[1, 2, 3, 4]).unwrap();

        assert_eq!(reading.temperature, 1);
        assert_eq!(reading.humidity, 2);
    }

    #[test]
    fn test_json_field_names() {
        let reading = Reading {
            temperature: 23,
            humidity: 54,
            time: "2024-01-01 12:00:00".to_string(),
        };

        let json: serde_json::Value =
            serde_json::from_slice(&reading.to_json().unwrap()).unwrap();

        assert_eq!(json["temperature"], 23);
        assert_eq!(json["humidity"], 54);
        assert_eq!(json["time"], "2024-01-01 12:00:00");
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = local_timestamp();

        // YYYY-MM-DD HH:MM:SS
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], " ");
        assert_eq!(&ts[13..14], ":");
    }
}

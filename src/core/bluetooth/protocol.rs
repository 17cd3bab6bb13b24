//! Text command protocol spoken over the write/notify characteristic pair.
//!
//! Frames are 8-bit text: every character maps to exactly one byte. Outbound
//! commands are `NAME:ARG\r\n` lines; inbound notifications are free-text
//! status lines, possibly several per notification.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::error::BluetoothError;

pub const FRAME_TERMINATOR: &str = "\r\n";

const POWER_PREFIX: &str = "POWER:";
const ERROR_TOKEN: &str = "ERROR";
const CHARGE_COMPLETE_TOKEN: &str = "CHARGE_COMPLETE";
const BATTERY_LOW_TOKEN: &str = "BATTERY_LOW";

/// Encodes text one byte per character. Characters above U+00FF have no
/// single-byte form and are rejected.
pub fn encode(text: &str) -> Result<Vec<u8>, BluetoothError> {
    text.chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| {
                BluetoothError::transport(format!("character {c:?} is outside the 8-bit range"))
            })
        })
        .collect()
}

/// Inverse of [`encode`]: every byte becomes the character with the same code.
pub fn decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Electrical telemetry carried by a `POWER:` frame, kept as reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerTelemetry {
    pub voltage: String,
    pub current: String,
    pub power: String,
}

/// One classified inbound status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Error(String),
    ChargeComplete,
    BatteryLow,
    Power(PowerTelemetry),
    /// Anything unrecognised, including partial frames cut by the MTU
    Telemetry(String),
}

fn field_separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"[\s,]+").expect("valid separator pattern"))
}

impl InboundFrame {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_matches(|c| c == '\r' || c == '\n');
        if line.contains(ERROR_TOKEN) {
            return Self::Error(line.to_string());
        }
        if line.contains(CHARGE_COMPLETE_TOKEN) {
            return Self::ChargeComplete;
        }
        if line.contains(BATTERY_LOW_TOKEN) {
            return Self::BatteryLow;
        }
        if let Some(rest) = line.trim_start().strip_prefix(POWER_PREFIX) {
            let fields: Vec<&str> = field_separator()
                .split(rest.trim())
                .filter(|f| !f.is_empty())
                .collect();
            if let [voltage, current, power, ..] = fields.as_slice() {
                return Self::Power(PowerTelemetry {
                    voltage: voltage.to_string(),
                    current: current.to_string(),
                    power: power.to_string(),
                });
            }
        }
        Self::Telemetry(line.to_string())
    }

    /// Splits one notification payload into its status lines.
    pub fn parse_all(message: &str) -> Vec<Self> {
        message
            .split(['\r', '\n'])
            .filter(|line| !line.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_one_byte_per_character() {
        assert_eq!(encode("CHARGE:1\r\n").unwrap(), b"CHARGE:1\r\n".to_vec());
        assert_eq!(encode("\u{00ff}").unwrap(), vec![0xff]);
        assert!(encode("\u{4e2d}").is_err());
    }

    #[test]
    fn decode_inverts_encode_over_the_byte_range() {
        let all: String = (0u8..=255).map(char::from).collect();
        assert_eq!(decode(&encode(&all).unwrap()), all);
    }

    #[test]
    fn power_frame_with_spaces() {
        assert_eq!(
            InboundFrame::parse("POWER:220 1.2 264"),
            InboundFrame::Power(PowerTelemetry {
                voltage: "220".into(),
                current: "1.2".into(),
                power: "264".into(),
            })
        );
    }

    #[test]
    fn power_frame_with_commas_and_terminator() {
        assert_eq!(
            InboundFrame::parse("POWER:219.5,0.80, 175\r\n"),
            InboundFrame::Power(PowerTelemetry {
                voltage: "219.5".into(),
                current: "0.80".into(),
                power: "175".into(),
            })
        );
    }

    #[test]
    fn truncated_power_frame_is_opaque() {
        assert_eq!(
            InboundFrame::parse("POWER:220 1."),
            InboundFrame::Telemetry("POWER:220 1.".into())
        );
    }

    #[test]
    fn recognised_tokens() {
        assert_eq!(InboundFrame::parse("E:ERROR 3"), InboundFrame::Error("E:ERROR 3".into()));
        assert_eq!(InboundFrame::parse("CHARGE_COMPLETE"), InboundFrame::ChargeComplete);
        assert_eq!(InboundFrame::parse("WARN BATTERY_LOW"), InboundFrame::BatteryLow);
        assert_eq!(InboundFrame::parse("T:31"), InboundFrame::Telemetry("T:31".into()));
    }

    #[test]
    fn multiple_lines_in_one_notification() {
        let frames = InboundFrame::parse_all("POWER:220 1 220\r\nBATTERY_LOW\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], InboundFrame::BatteryLow);
    }
}

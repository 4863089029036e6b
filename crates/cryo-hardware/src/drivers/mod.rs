//! Oxford Instruments device drivers.
//!
//! Every driver composes a [`Transport`](crate::transport::Transport) and
//! implements [`OxfordInstrument`]. Status words are decoded by fixed column
//! position; a reply that does not match the expected layout is a
//! [`CryoError::MalformedStatusReply`], never a default.

use async_trait::async_trait;
use cryo_core::error::{CryoError, CryoResult};
use serde::{Deserialize, Serialize};

pub mod ips120;
pub mod itc503;
pub mod magnet;
pub mod ps120;
pub mod valve;

/// Scriptable mock port for tests.
#[cfg(any(test, feature = "simulator"))]
pub mod mock_serial;

pub use ips120::Ips120;
pub use itc503::{Itc503, ItcStatus};
pub use magnet::{
    Activity, MagnetStatus, MagnetSupply, PolarityCommand, SupplyLink, SupplyModel,
    SwitchHeaterCommand, SwitchHeaterState,
};
pub use ps120::Ps120;
pub use valve::{OxfordValve, ValveStatus};

/// Capabilities shared by every Oxford instrument.
#[async_trait]
pub trait OxfordInstrument: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Opens the link and runs the instrument's bring-up sequence.
    async fn initialize(&mut self) -> CryoResult<()>;

    /// Sends one raw command and returns the reply payload.
    async fn communicate(&mut self, command: &str) -> CryoResult<String>;

    /// Reads and decodes the `X` status word.
    async fn read_status(&mut self) -> CryoResult<DeviceStatus>;

    /// Releases the link.
    async fn close(&mut self) -> CryoResult<()>;
}

/// Decoded status of any instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceStatus {
    /// ITC503 status.
    Temperature(ItcStatus),
    /// IPS120/PS120 status.
    Magnet(MagnetStatus),
    /// Valve state.
    Valve(ValveStatus),
}

/// Front panel / remote access mode (`C` command, `Cn` status column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Power-up state.
    #[default]
    LocalLocked,
    /// Remote and locked.
    RemoteLocked,
    /// Local and unlocked.
    LocalUnlocked,
    /// Remote and unlocked; used for all computer control.
    RemoteUnlocked,
    /// Magnet supply auto-run-down (status digits 4 to 7).
    AutoRunDown(u8),
}

impl ControlMode {
    /// Digit sent with `C`.
    pub fn digit(self) -> u8 {
        match self {
            ControlMode::LocalLocked => 0,
            ControlMode::RemoteLocked => 1,
            ControlMode::LocalUnlocked => 2,
            ControlMode::RemoteUnlocked => 3,
            ControlMode::AutoRunDown(d) => d,
        }
    }

    /// Decodes a status digit.
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(ControlMode::LocalLocked),
            1 => Some(ControlMode::RemoteLocked),
            2 => Some(ControlMode::LocalUnlocked),
            3 => Some(ControlMode::RemoteUnlocked),
            4..=7 => Some(ControlMode::AutoRunDown(digit)),
            _ => None,
        }
    }

    pub(crate) fn command(self) -> CryoResult<String> {
        match self {
            ControlMode::AutoRunDown(_) => Err(CryoError::InvalidParameter(
                "auto-run-down is reported by the instrument, not commanded".into(),
            )),
            mode => Ok(format!("C{}", mode.digit())),
        }
    }
}

/// A status reply with the leading `X` restored, so column offsets match the
/// documented layout.
pub(crate) struct StatusWord<'a> {
    device: &'a str,
    word: String,
}

impl<'a> StatusWord<'a> {
    /// Checks length and marker letters of a status payload.
    pub(crate) fn parse(
        device: &'a str,
        payload: &str,
        len: usize,
        markers: &[(usize, u8)],
    ) -> CryoResult<Self> {
        let word = format!("X{}", payload.trim());
        if !word.is_ascii() || word.len() < len {
            return Err(malformed_status(
                device,
                &word,
                format!("expected {} characters, got {}", len, word.len()),
            ));
        }
        for &(pos, marker) in markers {
            if word.as_bytes()[pos] != marker {
                return Err(malformed_status(
                    device,
                    &word,
                    format!("expected '{}' at column {}", marker as char, pos),
                ));
            }
        }
        Ok(Self { device, word })
    }

    /// Single decimal digit at `pos`.
    pub(crate) fn digit(&self, pos: usize) -> CryoResult<u8> {
        let byte = self.word.as_bytes()[pos];
        if byte.is_ascii_digit() {
            Ok(byte - b'0')
        } else {
            Err(malformed_status(
                self.device,
                &self.word,
                format!("expected a digit at column {}", pos),
            ))
        }
    }

    /// Two-digit number starting at `pos`.
    pub(crate) fn two_digits(&self, pos: usize) -> CryoResult<u8> {
        Ok(self.digit(pos)? * 10 + self.digit(pos + 1)?)
    }

    pub(crate) fn malformed(&self, reason: impl Into<String>) -> CryoError {
        malformed_status(self.device, &self.word, reason.into())
    }
}

fn malformed_status(device: &str, reply: &str, reason: String) -> CryoError {
    tracing::error!(device, reply, %reason, "Malformed status reply");
    CryoError::MalformedStatusReply {
        device: device.to_string(),
        reply: reply.to_string(),
        reason,
    }
}

/// Parses a numeric reading.
pub(crate) fn parse_reading(device: &str, command: &str, payload: &str) -> CryoResult<f64> {
    payload.trim().parse::<f64>().map_err(|_| {
        tracing::error!(device, command, reply = payload, "Unparseable reading");
        CryoError::MalformedReply {
            device: device.to_string(),
            command: command.to_string(),
            reply: payload.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_word_columns() {
        let word = StatusWord::parse("ITC", "0A3C3S12H2L1", 13, &[(0, b'X'), (2, b'A')]).unwrap();
        assert_eq!(word.digit(3).unwrap(), 3);
        assert_eq!(word.two_digits(7).unwrap(), 12);
        assert!(word.digit(2).is_err());
    }

    #[test]
    fn test_status_word_rejects_short_or_shifted() {
        assert!(matches!(
            StatusWord::parse("ITC", "0A3C3", 13, &[]),
            Err(CryoError::MalformedStatusReply { .. })
        ));
        assert!(StatusWord::parse("ITC", "00A3C3S12H2L", 13, &[(2, b'A')]).is_err());
    }

    #[test]
    fn test_parse_reading() {
        assert_eq!(parse_reading("ITC", "R1", "+4.215").unwrap(), 4.215);
        assert!(matches!(parse_reading("ITC", "R1", "abc"), Err(CryoError::MalformedReply { .. })));
    }

    #[test]
    fn test_control_mode_digits() {
        assert_eq!(ControlMode::RemoteUnlocked.command().unwrap(), "C3");
        assert_eq!(ControlMode::from_digit(5), Some(ControlMode::AutoRunDown(5)));
        assert_eq!(ControlMode::from_digit(9), None);
        assert!(ControlMode::AutoRunDown(4).command().is_err());
    }
}

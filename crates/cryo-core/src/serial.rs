//! Port abstractions for instrument links.
//!
//! Oxford instruments on an ISOBUS line share one physical port, and the
//! transport has to inspect and clear that port's buffers between
//! transactions. [`InstrumentPort`] adds those two operations to async I/O so
//! real serial streams, mock ports and simulated instruments are
//! interchangeable.
//!
//! # Types
//!
//! - [`InstrumentPort`]: async read/write plus buffer inspection and clearing
//! - [`DynPort`]: type-erased boxed port
//! - [`SharedPort`]: port shared between drivers with buffered reading
//! - [`LineSettings`]: baud, parity, data bits, stop bits
//!
//! # Feature Flag
//!
//! [`open_serial_async`] and the `SerialStream` implementation need the
//! `serial` feature.
//!
//! # Example
//!
//! ```rust,ignore
//! use cryo_core::serial::{open_serial_async, wrap_shared, LineSettings};
//!
//! let port = open_serial_async("/dev/ttyUSB0", &LineSettings::default(), "ITC503").await?;
//! let shared = wrap_shared(Box::new(port));
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;

use crate::error::{CryoError, CryoResult};

// =============================================================================
// Port Trait
// =============================================================================

/// Async byte link to an instrument.
pub trait InstrumentPort: AsyncRead + AsyncWrite + Unpin + Send {
    /// Bytes received by the port but not yet read.
    fn bytes_to_read(&self) -> std::io::Result<u32>;

    /// Discards pending input and output.
    fn clear_buffers(&self) -> std::io::Result<()>;
}

/// Type-erased boxed port.
pub type DynPort = Box<dyn InstrumentPort>;

/// Port shared by every driver on one line.
///
/// The transport holds the lock for a whole write/read exchange, so replies
/// from different ISOBUS addresses never interleave.
pub type SharedPort = Arc<Mutex<BufReader<DynPort>>>;

/// Wraps a port for sharing.
pub fn wrap_shared(port: DynPort) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

// =============================================================================
// Line Settings
// =============================================================================

/// Parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always 1.
    Mark,
    /// Parity bit always 0.
    Space,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    /// One stop bit.
    #[default]
    #[serde(rename = "1")]
    One,
    /// One and a half stop bits.
    #[serde(rename = "1.5")]
    OnePointFive,
    /// Two stop bits.
    #[serde(rename = "2")]
    Two,
}

/// Baud rates the Oxford instruments support.
pub const SUPPORTED_BAUD_RATES: [u32; 6] = [300, 600, 2400, 4800, 9600, 19200];

/// Serial line configuration. Defaults to 9600 8N1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSettings {
    /// Baud rate.
    pub baud: u32,
    /// Parity.
    pub parity: Parity,
    /// Data bits (7 or 8).
    pub data_bits: u8,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: StopBits::One,
        }
    }
}

impl LineSettings {
    /// Checks the settings against what the instruments accept.
    pub fn validate(&self) -> CryoResult<()> {
        if !SUPPORTED_BAUD_RATES.contains(&self.baud) {
            return Err(CryoError::Configuration(format!(
                "unsupported baud rate {} (expected one of {:?})",
                self.baud, SUPPORTED_BAUD_RATES
            )));
        }
        if !matches!(self.data_bits, 7 | 8) {
            return Err(CryoError::Configuration(format!(
                "unsupported data bits {} (expected 7 or 8)",
                self.data_bits
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

#[cfg(feature = "serial")]
impl InstrumentPort for tokio_serial::SerialStream {
    fn bytes_to_read(&self) -> std::io::Result<u32> {
        use tokio_serial::SerialPort;
        Ok(SerialPort::bytes_to_read(self)?)
    }

    fn clear_buffers(&self) -> std::io::Result<()> {
        use tokio_serial::SerialPort;
        Ok(self.clear(tokio_serial::ClearBuffer::All)?)
    }
}

#[cfg(feature = "serial")]
fn to_backend(settings: &LineSettings) -> CryoResult<(tokio_serial::Parity, tokio_serial::DataBits, tokio_serial::StopBits)> {
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Mark | Parity::Space => {
            return Err(CryoError::Configuration(format!(
                "{:?} parity is not supported by the serial backend",
                settings.parity
            )))
        }
    };
    let data_bits = match settings.data_bits {
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let stop_bits = match settings.stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
        StopBits::OnePointFive => {
            return Err(CryoError::Configuration(
                "1.5 stop bits are not supported by the serial backend".into(),
            ))
        }
    };
    Ok((parity, data_bits, stop_bits))
}

/// Opens a serial port on a blocking thread with the given line settings and
/// no flow control.
///
/// # Errors
///
/// `Configuration` for settings the backend cannot express, `Io` when the
/// port cannot be opened.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    settings: &LineSettings,
    device_name: &str,
) -> CryoResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    settings.validate()?;
    let (parity, data_bits, stop_bits) = to_backend(settings)?;
    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();
    let baud = settings.baud;

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                CryoError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!(
                        "Failed to open {} serial port {}: {}",
                        device_name_owned, port_path_owned, e
                    ),
                ))
            })
    })
    .await
    .map_err(|e| CryoError::Io(std::io::Error::other(format!("spawn_blocking for serial port opening failed: {e}"))))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_line_settings() {
        let settings = LineSettings::default();
        assert_eq!(settings.baud, 9600);
        assert_eq!(settings.data_bits, 8);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rejects_unsupported_settings() {
        let fast = LineSettings { baud: 115200, ..LineSettings::default() };
        assert!(matches!(fast.validate(), Err(CryoError::Configuration(_))));
        let six = LineSettings { data_bits: 6, ..LineSettings::default() };
        assert!(six.validate().is_err());
    }

    #[test]
    fn test_line_settings_from_toml() {
        let settings: LineSettings = toml::from_str(
            r#"
            baud = 19200
            parity = "even"
            data_bits = 7
            stop_bits = "2"
            "#,
        )
        .unwrap();
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, StopBits::Two);
        assert!(settings.validate().is_ok());
    }
}

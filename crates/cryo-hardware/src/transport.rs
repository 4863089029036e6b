//! Oxford Instruments command transport.
//!
//! Protocol Overview:
//! - ASCII request/response, CR terminated
//! - Request: `[@<isobus address>]<verb><payload>\r`
//! - Reply: `<echoed request><data>\r`
//! - Commands starting with `Q` or `$` get no reply
//! - Wire variants: direct GPIB, direct serial, ISOBUS (addressed serial
//!   multidrop) and the GPIB-to-ISOBUS gateway (master and slaves)
//!
//! Every transaction waits a fixed turnaround delay, and on serial/ISOBUS
//! lines clears residual input left by other devices before writing. The
//! echoed command is verified byte for byte; a mismatch is a fatal protocol
//! error and is never retried.
//!
//! # Example
//!
//! ```rust,ignore
//! use cryo_hardware::transport::{DeviceAddress, OxfordTransport, Transport};
//!
//! let mut link = OxfordTransport::new("ITC503", DeviceAddress::isobus("/dev/ttyUSB0", 1));
//! link.open().await?;
//! let sensor1 = link.send_receive("R1").await?;
//! ```

use async_trait::async_trait;
use cryo_core::error::{CryoError, CryoResult};
use cryo_core::serial::{LineSettings, SharedPort};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::shared_ports;

/// Turnaround delay enforced before every transaction.
pub const COMMAND_DELAY: Duration = Duration::from_millis(100);
/// Settle time before clearing residual bytes.
pub const FLUSH_SETTLE_BEFORE: Duration = Duration::from_millis(50);
/// Settle time after clearing residual bytes.
pub const FLUSH_SETTLE_AFTER: Duration = Duration::from_millis(100);
/// How long to wait for a reply terminator.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Settle time between opening a serial line and clearing it.
pub const OPEN_SETTLE: Duration = Duration::from_millis(100);

const TERMINATOR: u8 = b'\r';

/// Wire variant of an instrument link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Direct GPIB, unframed.
    Gpib,
    /// Direct RS-232, unframed.
    Serial,
    /// Addressed serial multidrop.
    #[default]
    Isobus,
    /// GPIB link to an ISOBUS gateway; commands are framed.
    GatewayMaster,
    /// Device behind a gateway master; reuses the master's link.
    GatewaySlave,
}

impl Protocol {
    /// Whether commands get an `@<address>` prefix.
    pub fn is_framed(self) -> bool {
        matches!(
            self,
            Protocol::Isobus | Protocol::GatewayMaster | Protocol::GatewaySlave
        )
    }

    /// Whether residual input is cleared before each transaction.
    pub fn flushes_residual(self) -> bool {
        matches!(self, Protocol::Serial | Protocol::Isobus)
    }
}

/// Where and how to reach one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAddress {
    /// Wire variant.
    #[serde(default)]
    pub protocol: Protocol,
    /// Port path of the serial line or GPIB bridge.
    pub resource: String,
    /// ISOBUS address for framed variants (0 when absent).
    #[serde(default)]
    pub isobus_address: Option<u8>,
    /// Serial line settings (9600 8N1 when absent).
    #[serde(default)]
    pub line: Option<LineSettings>,
}

impl DeviceAddress {
    /// ISOBUS device on `resource` at `address`.
    pub fn isobus(resource: impl Into<String>, address: u8) -> Self {
        Self {
            protocol: Protocol::Isobus,
            resource: resource.into(),
            isobus_address: Some(address),
            line: None,
        }
    }

    /// Unframed device using `protocol`.
    pub fn direct(protocol: Protocol, resource: impl Into<String>) -> Self {
        Self {
            protocol,
            resource: resource.into(),
            isobus_address: None,
            line: None,
        }
    }

    /// Effective line settings.
    pub fn line_settings(&self) -> LineSettings {
        self.line.unwrap_or_default()
    }

    /// Checks the record before any port is touched.
    pub fn validate(&self) -> CryoResult<()> {
        if self.resource.trim().is_empty() {
            return Err(CryoError::Configuration("device address has no resource".into()));
        }
        if let Some(line) = &self.line {
            line.validate()?;
        }
        Ok(())
    }
}

/// Applies ISOBUS framing. A leading `$` stays in front of the address.
pub fn frame(protocol: Protocol, address: Option<u8>, command: &str) -> String {
    if !protocol.is_framed() {
        return command.to_string();
    }
    let address = address.unwrap_or(0);
    match command.strip_prefix('$') {
        Some(rest) => format!("$@{}{}", address, rest),
        None => format!("@{}{}", address, command),
    }
}

/// Commands the instrument does not answer.
pub fn is_fire_and_forget(command: &str) -> bool {
    command.starts_with('Q') || command.starts_with('$')
}

/// Checks the echo and returns the trimmed payload after it.
pub fn verify_echo<'a>(device: &str, command: &str, reply: &'a str) -> CryoResult<&'a str> {
    match reply.strip_prefix(command) {
        Some(payload) => Ok(payload.trim()),
        None => {
            tracing::error!(
                device,
                command,
                response = reply,
                "{} returned nonsense ({}) on command {}.",
                device,
                reply,
                command
            );
            Err(CryoError::ProtocolEchoMismatch {
                device: device.to_string(),
                command: command.to_string(),
                response: reply.to_string(),
            })
        }
    }
}

/// Request/response link shared by every driver.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name used in logs and errors.
    fn device(&self) -> &str;

    /// Opens (or attaches to) the link.
    async fn open(&mut self) -> CryoResult<()>;

    /// Sends one command and returns the payload of its reply.
    async fn send_receive(&mut self, command: &str) -> CryoResult<String>;

    /// Releases the link.
    async fn close(&mut self) -> CryoResult<()>;
}

#[derive(Clone)]
enum PortSource {
    Registry,
    Attached(SharedPort),
}

/// [`Transport`] for Oxford instruments.
pub struct OxfordTransport {
    device: String,
    address: DeviceAddress,
    source: PortSource,
    port: Option<SharedPort>,
    command_delay: Duration,
    reply_timeout: Duration,
}

impl OxfordTransport {
    /// Link that opens its port through the shared line registry.
    pub fn new(device: impl Into<String>, address: DeviceAddress) -> Self {
        Self {
            device: device.into(),
            address,
            source: PortSource::Registry,
            port: None,
            command_delay: COMMAND_DELAY,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    /// Link over an already constructed port (mock, simulator, or a port the
    /// caller manages).
    pub fn with_port(device: impl Into<String>, address: DeviceAddress, port: SharedPort) -> Self {
        Self {
            source: PortSource::Attached(port),
            ..Self::new(device, address)
        }
    }

    /// Overrides the reply timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// The address this link was built with.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Whether `open` has succeeded and `close` has not been called.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn framed(&self, command: &str) -> String {
        frame(self.address.protocol, self.address.isobus_address, command)
    }

    async fn acquire_port(&self) -> CryoResult<SharedPort> {
        if let PortSource::Attached(port) = &self.source {
            return Ok(port.clone());
        }
        let resource = &self.address.resource;
        match self.address.protocol {
            Protocol::Serial | Protocol::Isobus => {
                shared_ports::get_or_open_port(resource, &self.address.line_settings(), &self.device).await
            }
            Protocol::Gpib | Protocol::GatewayMaster => {
                shared_ports::get_or_open_port(resource, &LineSettings::default(), &self.device).await
            }
            Protocol::GatewaySlave => shared_ports::get_existing_port(resource)
                .ok_or_else(|| shared_ports::missing_master(&self.device, resource)),
        }
    }
}

/// Clears bytes left on the line by earlier exchanges.
async fn flush_residual(
    device: &str,
    guard: &mut tokio::io::BufReader<cryo_core::serial::DynPort>,
) -> CryoResult<()> {
    let pending = guard.buffer().len() + guard.get_ref().bytes_to_read()? as usize;
    if pending == 0 {
        return Ok(());
    }
    tracing::debug!(device, pending, "Clearing residual bytes before command");
    tokio::time::sleep(FLUSH_SETTLE_BEFORE).await;
    guard.get_ref().clear_buffers()?;
    let buffered = guard.buffer().len();
    guard.consume(buffered);
    tokio::time::sleep(FLUSH_SETTLE_AFTER).await;
    Ok(())
}

#[async_trait]
impl Transport for OxfordTransport {
    fn device(&self) -> &str {
        &self.device
    }

    #[instrument(skip(self), fields(device = %self.device, resource = %self.address.resource), err)]
    async fn open(&mut self) -> CryoResult<()> {
        self.address.validate()?;
        let port = self.acquire_port().await?;
        if self.address.protocol.flushes_residual() {
            tokio::time::sleep(OPEN_SETTLE).await;
            let mut guard = port.lock().await;
            guard.get_ref().clear_buffers()?;
            let buffered = guard.buffer().len();
            guard.consume(buffered);
        }
        self.port = Some(port);
        tracing::info!(device = %self.device, protocol = ?self.address.protocol, "Opened instrument link");
        Ok(())
    }

    async fn send_receive(&mut self, command: &str) -> CryoResult<String> {
        let port = self.port.as_ref().ok_or(CryoError::SerialPortNotConnected)?;
        let framed = self.framed(command);
        let mut guard = port.lock().await;
        tokio::time::sleep(self.command_delay).await;

        if self.address.protocol.flushes_residual() {
            flush_residual(&self.device, &mut guard).await?;
        }

        let mut wire = framed.clone().into_bytes();
        wire.push(TERMINATOR);
        guard.get_mut().write_all(&wire).await?;
        guard.get_mut().flush().await?;

        if is_fire_and_forget(&framed) {
            tracing::trace!(device = %self.device, command = %framed, "Sent command without reply");
            return Ok(String::new());
        }

        let mut raw = Vec::new();
        let read = tokio::time::timeout(self.reply_timeout, guard.read_until(TERMINATOR, &mut raw)).await;
        match read {
            Err(_) | Ok(Ok(0)) => {
                return Err(CryoError::NoReply {
                    device: self.device.clone(),
                    command: framed,
                })
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        let text = String::from_utf8_lossy(&raw);
        let reply = text.trim_end_matches(['\r', '\n']);
        let payload = verify_echo(&self.device, &framed, reply)?;
        tracing::trace!(device = %self.device, command = %framed, payload, "Command answered");
        Ok(payload.to_string())
    }

    async fn close(&mut self) -> CryoResult<()> {
        if let Some(port) = self.port.take() {
            if matches!(self.source, PortSource::Registry) {
                shared_ports::release_port(&self.address.resource, port);
            }
            tracing::info!(device = %self.device, "Closed instrument link");
        }
        Ok(())
    }
}

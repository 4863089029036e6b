//! Oxford Instruments gas-handling valve.
//!
//! One channel of a valve controller, driven by `S<channel><bit>` and read
//! back with `R<channel>`. Which bit opens the valve depends on whether it is
//! normally closed.

use async_trait::async_trait;
use cryo_core::error::{CryoError, CryoResult};
use tracing::instrument;

use super::{ControlMode, DeviceStatus, OxfordInstrument};
use crate::transport::{DeviceAddress, OxfordTransport, Transport};

/// Valve readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveStatus {
    /// Whether the valve is open.
    pub open: bool,
}

/// Valve driver.
pub struct OxfordValve {
    link: Box<dyn Transport>,
    channel: u8,
    normally_closed: bool,
    open_command: String,
    close_command: String,
    open_condition: &'static str,
}

impl OxfordValve {
    /// Driver that opens `address` through the shared line registry.
    ///
    /// # Errors
    /// `InvalidParameter` when `channel` is not a single digit.
    pub fn new(
        name: impl Into<String>,
        address: DeviceAddress,
        channel: u8,
        normally_closed: bool,
    ) -> CryoResult<Self> {
        Self::with_transport(Box::new(OxfordTransport::new(name, address)), channel, normally_closed)
    }

    /// Driver over an existing transport.
    pub fn with_transport(link: Box<dyn Transport>, channel: u8, normally_closed: bool) -> CryoResult<Self> {
        if channel > 9 {
            return Err(CryoError::InvalidParameter(format!(
                "valve channel must be a single digit (got {})",
                channel
            )));
        }
        let (open_bit, close_bit, open_condition) = if normally_closed {
            (1, 0, "1")
        } else {
            (0, 1, "0")
        };
        Ok(Self {
            link,
            channel,
            normally_closed,
            open_command: format!("S{}{}", channel, open_bit),
            close_command: format!("S{}{}", channel, close_bit),
            open_condition,
        })
    }

    /// Configured channel.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Whether the valve closes when unpowered.
    pub fn normally_closed(&self) -> bool {
        self.normally_closed
    }

    /// Opens the valve.
    #[instrument(skip(self), fields(device = %self.link.device(), channel = self.channel), err)]
    pub async fn open_valve(&mut self) -> CryoResult<()> {
        self.link.send_receive(&self.open_command).await?;
        Ok(())
    }

    /// Closes the valve.
    #[instrument(skip(self), fields(device = %self.link.device(), channel = self.channel), err)]
    pub async fn close_valve(&mut self) -> CryoResult<()> {
        self.link.send_receive(&self.close_command).await?;
        Ok(())
    }

    /// Reads whether the valve is open.
    pub async fn is_open(&mut self) -> CryoResult<bool> {
        let reply = self.link.send_receive(&format!("R{}", self.channel)).await?;
        Ok(reply == self.open_condition)
    }
}

#[async_trait]
impl OxfordInstrument for OxfordValve {
    fn name(&self) -> &str {
        self.link.device()
    }

    async fn initialize(&mut self) -> CryoResult<()> {
        self.link.open().await?;
        self.link
            .send_receive(&ControlMode::RemoteUnlocked.command()?)
            .await?;
        let open = self.is_open().await?;
        tracing::info!(device = %self.link.device(), channel = self.channel, open, "Valve initialized");
        Ok(())
    }

    async fn communicate(&mut self, command: &str) -> CryoResult<String> {
        self.link.send_receive(command).await
    }

    async fn read_status(&mut self) -> CryoResult<DeviceStatus> {
        Ok(DeviceStatus::Valve(ValveStatus {
            open: self.is_open().await?,
        }))
    }

    async fn close(&mut self) -> CryoResult<()> {
        self.link.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial;
    use cryo_core::serial::wrap_shared;

    fn mock_valve(normally_closed: bool) -> (OxfordValve, mock_serial::MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let link = OxfordTransport::with_port("Valve", DeviceAddress::isobus("mock", 5), wrap_shared(Box::new(port)));
        (OxfordValve::with_transport(Box::new(link), 2, normally_closed).unwrap(), harness)
    }

    #[tokio::test(start_paused = true)]
    async fn test_normally_closed_commands() {
        let (mut valve, mut harness) = mock_valve(true);
        valve.link.open().await.unwrap();
        let task = tokio::spawn(async move {
            valve.open_valve().await.unwrap();
            let open = valve.is_open().await.unwrap();
            valve.close_valve().await.unwrap();
            open
        });
        harness.expect_and_respond(b"@5S21\r", b"@5S21\r").await;
        harness.expect_and_respond(b"@5R2\r", b"@5R21\r").await;
        harness.expect_and_respond(b"@5S20\r", b"@5S20\r").await;
        assert!(task.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_normally_open_commands_are_reversed() {
        let (mut valve, mut harness) = mock_valve(false);
        valve.link.open().await.unwrap();
        let task = tokio::spawn(async move {
            valve.open_valve().await.unwrap();
            valve.is_open().await.unwrap()
        });
        harness.expect_and_respond(b"@5S20\r", b"@5S20\r").await;
        harness.expect_and_respond(b"@5R2\r", b"@5R21\r").await;
        assert!(!task.await.unwrap());
    }

    #[test]
    fn test_channel_must_be_digit() {
        let (port, _harness) = mock_serial::new();
        let link = OxfordTransport::with_port("Valve", DeviceAddress::isobus("mock", 5), wrap_shared(Box::new(port)));
        assert!(matches!(
            OxfordValve::with_transport(Box::new(link), 12, true),
            Err(CryoError::InvalidParameter(_))
        ));
    }
}

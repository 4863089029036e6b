//! Oxford Instruments IPS120 superconducting magnet power supply
//!
//! Protocol Overview:
//! - Field target: `J<tesla, 4 decimals>`, then `A1` to sweep
//! - Sweep rate: `T<tesla/min, 3 decimals>`
//! - Readings (signed, tesla): `R7` output field, `R8` target, `R9` rate
//! - Status layout shared with the PS120 (see [`super::magnet`])

use async_trait::async_trait;
use cryo_core::error::CryoResult;
use std::time::Duration;
use tracing::instrument;

use super::magnet::{
    Activity, MagnetSupply, PolarityCommand, SupplyLink, SupplyModel, SwitchHeaterCommand,
    DEFAULT_SWITCH_HEATER_DELAY,
};
use super::{ControlMode, DeviceStatus, OxfordInstrument};
use crate::transport::{DeviceAddress, OxfordTransport, Transport};

/// Sweep rate applied at bring-up (T/min).
pub const INITIAL_SWEEP_RATE: f64 = 0.5;
/// Sweep mode word applied at bring-up.
pub const INITIAL_SWEEP_MODE: u8 = 9;

/// IPS120 driver.
pub struct Ips120 {
    supply: SupplyLink,
    switch_heater_delay: Duration,
}

impl Ips120 {
    /// Driver that opens `address` through the shared line registry.
    pub fn new(name: impl Into<String>, address: DeviceAddress) -> Self {
        Self::with_transport(Box::new(OxfordTransport::new(name, address)))
    }

    /// Driver over an existing transport.
    pub fn with_transport(link: Box<dyn Transport>) -> Self {
        Self {
            supply: SupplyLink::new(link),
            switch_heater_delay: DEFAULT_SWITCH_HEATER_DELAY,
        }
    }

    /// Switch heater settle time used by [`OxfordInstrument::initialize`].
    pub fn with_switch_heater_delay(mut self, delay: Duration) -> Self {
        self.switch_heater_delay = delay;
        self
    }
}

#[async_trait]
impl OxfordInstrument for Ips120 {
    fn name(&self) -> &str {
        self.supply.device()
    }

    #[instrument(skip(self), fields(device = %self.supply.device()), err)]
    async fn initialize(&mut self) -> CryoResult<()> {
        self.supply.open().await?;
        self.set_control_mode(ControlMode::RemoteUnlocked).await?;
        self.set_activity(Activity::Hold).await?;
        self.set_polarity(PolarityCommand::Forward).await?;
        self.set_sweep_rate(INITIAL_SWEEP_RATE).await?;
        self.set_sweep_mode(INITIAL_SWEEP_MODE).await?;
        let delay = self.switch_heater_delay;
        self.set_switch_heater(SwitchHeaterCommand::Off, delay).await?;
        tracing::info!(device = %self.supply.device(), status = ?self.supply.cached_status(), "IPS120 initialized");
        Ok(())
    }

    async fn communicate(&mut self, command: &str) -> CryoResult<String> {
        self.supply.communicate(command).await
    }

    async fn read_status(&mut self) -> CryoResult<DeviceStatus> {
        Ok(DeviceStatus::Magnet(self.supply.refresh_status().await?))
    }

    async fn close(&mut self) -> CryoResult<()> {
        self.supply.close().await
    }
}

#[async_trait]
impl MagnetSupply for Ips120 {
    fn model(&self) -> SupplyModel {
        SupplyModel::Ips120
    }

    fn supply_link(&mut self) -> &mut SupplyLink {
        &mut self.supply
    }

    #[instrument(skip(self), fields(device = %self.supply.device()), err)]
    async fn set_field(&mut self, tesla: f64) -> CryoResult<()> {
        self.supply.communicate(&format!("J{:.4}", tesla)).await?;
        self.set_activity(Activity::ToSetpoint).await
    }

    #[instrument(skip(self), fields(device = %self.supply.device()), err)]
    async fn set_sweep_rate(&mut self, tesla_per_min: f64) -> CryoResult<()> {
        self.supply.communicate(&format!("T{:.3}", tesla_per_min)).await?;
        Ok(())
    }

    async fn get_field(&mut self) -> CryoResult<f64> {
        self.supply.refresh_status().await?;
        self.supply.read("R7").await
    }

    async fn get_field_setpoint(&mut self) -> CryoResult<f64> {
        self.supply.read("R8").await
    }

    async fn get_sweep_rate(&mut self) -> CryoResult<f64> {
        self.supply.read("R9").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::magnet::SwitchHeaterState;
    use crate::drivers::mock_serial;
    use cryo_core::error::CryoError;
    use cryo_core::serial::wrap_shared;

    fn mock_ips() -> (Ips120, mock_serial::MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let link = OxfordTransport::with_port("IPS120", DeviceAddress::isobus("mock", 2), wrap_shared(Box::new(port)));
        (Ips120::with_transport(Box::new(link)), harness)
    }

    async fn echo(harness: &mut mock_serial::MockDeviceHarness, command: &str) {
        let wire = format!("{}\r", command);
        harness.expect_and_respond(wire.as_bytes(), wire.as_bytes()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_sequence() {
        let (ips, mut harness) = mock_ips();
        let mut ips = ips.with_switch_heater_delay(Duration::from_secs(20));
        let task = tokio::spawn(async move {
            ips.initialize().await.unwrap();
            ips
        });
        for command in ["@2C3", "@2A0", "@2P1", "@2T0.500", "@2M9", "@2H0"] {
            echo(&mut harness, command).await;
        }
        tokio::time::sleep(Duration::from_secs(20)).await;
        harness.expect_and_respond(b"@2X\r", b"@2X00A0C3H0M10P00\r").await;
        let mut ips = task.await.unwrap();
        assert_eq!(ips.get_activity().await.unwrap(), Activity::Hold);
    }

    #[tokio::test(start_paused = true)]
    async fn test_field_commands() {
        let (mut ips, mut harness) = mock_ips();
        ips.supply.open().await.unwrap();
        let task = tokio::spawn(async move {
            ips.set_sweep_rate(0.25).await.unwrap();
            ips.set_field(-0.1).await.unwrap();
            let field = ips.get_field().await.unwrap();
            let target = ips.get_field_setpoint().await.unwrap();
            (field, target)
        });
        echo(&mut harness, "@2T0.250").await;
        echo(&mut harness, "@2J-0.1000").await;
        echo(&mut harness, "@2A1").await;
        harness.expect_and_respond(b"@2X\r", b"@2X00A1C3H1M11P00\r").await;
        harness.expect_and_respond(b"@2R7\r", b"@2R7-0.0500\r").await;
        harness.expect_and_respond(b"@2R8\r", b"@2R8-0.1000\r").await;
        assert_eq!(task.await.unwrap(), (-0.05, -0.1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_heater_delay_validated_and_blocking() {
        let (mut ips, mut harness) = mock_ips();
        ips.supply.open().await.unwrap();
        assert!(matches!(
            ips.set_switch_heater(SwitchHeaterCommand::ForceOn, Duration::from_secs(10)).await,
            Err(CryoError::InvalidParameter(_))
        ));

        let started = tokio::time::Instant::now();
        let task = tokio::spawn(async move {
            ips.set_switch_heater(SwitchHeaterCommand::ForceOn, Duration::from_secs(15)).await.unwrap();
            ips
        });
        echo(&mut harness, "@2H2").await;
        tokio::time::sleep(Duration::from_secs(15)).await;
        harness.expect_and_respond(b"@2X\r", b"@2X00A0C3H1M10P00\r").await;
        let mut ips = task.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(
            ips.supply_link().cached_status().map(|s| s.switch_heater),
            Some(SwitchHeaterState::On)
        );
    }
}

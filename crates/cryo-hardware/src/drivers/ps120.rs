//! Oxford Instruments PS120 magnet power supply
//!
//! Protocol Overview:
//! - Fields and rates are unsigned integers in millitesla (mT/min for rates)
//! - The sign lives in the polarity flags: polarity 2 digit `1` means the
//!   output is forward, `2` reverse; polarity 1 digit 4 or above means the
//!   target is negative
//! - Going through zero needs an explicit `P1`/`P2` before `J`
//! - Status layout shared with the IPS120 (see [`super::magnet`])

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

fn to_millitesla(tesla: f64) -> i64 {
    (tesla * 1000.0).abs().round() as i64
}

/// PS120 driver.
pub struct Ps120 {
    supply: SupplyLink,
    switch_heater_delay: Duration,
}

impl Ps120 {
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
impl OxfordInstrument for Ps120 {
    fn name(&self) -> &str {
        self.supply.device()
    }

    #[instrument(skip(self), fields(device = %self.supply.device()), err)]
    async fn initialize(&mut self) -> CryoResult<()> {
        self.supply.open().await?;
        self.supply.refresh_status().await?;
        self.set_control_mode(ControlMode::RemoteUnlocked).await?;
        self.set_activity(Activity::Hold).await?;
        self.set_polarity(PolarityCommand::Forward).await?;
        self.set_sweep_rate(INITIAL_SWEEP_RATE).await?;
        self.set_sweep_mode(INITIAL_SWEEP_MODE).await?;
        let delay = self.switch_heater_delay;
        self.set_switch_heater(SwitchHeaterCommand::Off, delay).await?;
        tracing::info!(device = %self.supply.device(), status = ?self.supply.cached_status(), "PS120 initialized");
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
impl MagnetSupply for Ps120 {
    fn model(&self) -> SupplyModel {
        SupplyModel::Ps120
    }

    fn supply_link(&mut self) -> &mut SupplyLink {
        &mut self.supply
    }

    /// Reads the polarity, flips it if the target is on the other side of
    /// zero, then writes the magnitude and starts the sweep.
    #[instrument(skip(self), fields(device = %self.supply.device()), err)]
    async fn set_field(&mut self, tesla: f64) -> CryoResult<()> {
        let status = self.supply.refresh_status().await?;
        let forward = status.polarity2 == 1;
        if tesla.is_sign_positive() && !forward {
            self.set_polarity(PolarityCommand::Forward).await?;
        } else if tesla.is_sign_negative() && forward {
            self.set_polarity(PolarityCommand::Reverse).await?;
        }
        self.supply
            .communicate(&format!("J{}", to_millitesla(tesla)))
            .await?;
        self.set_activity(Activity::ToSetpoint).await
    }

    #[instrument(skip(self), fields(device = %self.supply.device()), err)]
    async fn set_sweep_rate(&mut self, tesla_per_min: f64) -> CryoResult<()> {
        self.supply
            .communicate(&format!("T{}", to_millitesla(tesla_per_min)))
            .await?;
        Ok(())
    }

    async fn get_field(&mut self) -> CryoResult<f64> {
        let status = self.supply.refresh_status().await?;
        let field = self.supply.read("R7").await? / 1000.0;
        Ok(if status.polarity2 == 2 { -field } else { field })
    }

    async fn get_field_setpoint(&mut self) -> CryoResult<f64> {
        let status = self.supply.status_or_refresh().await?;
        let target = self.supply.read("R8").await? / 1000.0;
        Ok(if status.polarity1 >= 4 { -target } else { target })
    }

    async fn get_sweep_rate(&mut self) -> CryoResult<f64> {
        Ok(self.supply.read("R9").await? / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial;
    use cryo_core::serial::wrap_shared;

    fn mock_ps() -> (Ps120, mock_serial::MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let link = OxfordTransport::with_port("PS120", DeviceAddress::isobus("mock", 3), wrap_shared(Box::new(port)));
        (Ps120::with_transport(Box::new(link)), harness)
    }

    async fn echo(harness: &mut mock_serial::MockDeviceHarness, command: &str) {
        let wire = format!("{}\r", command);
        harness.expect_and_respond(wire.as_bytes(), wire.as_bytes()).await;
    }

    #[test]
    fn test_millitesla_conversion() {
        assert_eq!(to_millitesla(0.1234), 123);
        assert_eq!(to_millitesla(-0.0005), 1);
        assert_eq!(to_millitesla(0.5), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_sequence() {
        let (ps, mut harness) = mock_ps();
        let mut ps = ps.with_switch_heater_delay(Duration::from_secs(15));
        let task = tokio::spawn(async move { ps.initialize().await });
        harness.expect_and_respond(b"@3X\r", b"@3X00A0C1H0M10P01\r").await;
        for command in ["@3C3", "@3A0", "@3P1", "@3T500", "@3M9", "@3H0"] {
            echo(&mut harness, command).await;
        }
        tokio::time::sleep(Duration::from_secs(15)).await;
        harness.expect_and_respond(b"@3X\r", b"@3X00A0C3H0M10P01\r").await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_field_reverses_polarity() {
        let (mut ps, mut harness) = mock_ps();
        ps.supply.open().await.unwrap();
        let task = tokio::spawn(async move { ps.set_field(-0.25).await });
        harness.expect_and_respond(b"@3X\r", b"@3X00A0C3H1M10P01\r").await;
        echo(&mut harness, "@3P2").await;
        echo(&mut harness, "@3J250").await;
        echo(&mut harness, "@3A1").await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_positive_field_keeps_forward_polarity() {
        let (mut ps, mut harness) = mock_ps();
        ps.supply.open().await.unwrap();
        let task = tokio::spawn(async move { ps.set_field(0.1).await });
        harness.expect_and_respond(b"@3X\r", b"@3X00A0C3H1M10P01\r").await;
        echo(&mut harness, "@3J100").await;
        echo(&mut harness, "@3A1").await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_readings() {
        let (mut ps, mut harness) = mock_ps();
        ps.supply.open().await.unwrap();
        let task = tokio::spawn(async move {
            let field = ps.get_field().await.unwrap();
            let target = ps.get_field_setpoint().await.unwrap();
            let rate = ps.get_sweep_rate().await.unwrap();
            (field, target, rate)
        });
        harness.expect_and_respond(b"@3X\r", b"@3X00A1C3H1M11P42\r").await;
        harness.expect_and_respond(b"@3R7\r", b"@3R7+00120\r").await;
        harness.expect_and_respond(b"@3R8\r", b"@3R8+00250\r").await;
        harness.expect_and_respond(b"@3R9\r", b"@3R9+00100\r").await;
        assert_eq!(task.await.unwrap(), (-0.12, -0.25, 0.1));
    }
}

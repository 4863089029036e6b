//! Oxford Instruments ITC503 Intelligent Temperature Controller
//!
//! Protocol Overview:
//! - Status: `X` -> `XnAnCnSnnHnLn`
//!   - `An` auto/manual: 0 heater manual + gas manual, 1 heater auto + gas
//!     manual, 2 heater manual + gas auto, 3 both auto
//!   - `Cn` control mode, `Snn` sweep step, `Hn` active heater sensor,
//!     `Ln` auto-PID
//! - Setpoint: `T<value>` (at most four characters)
//! - PID: `P` (3 decimals), `I` and `D` (1 decimal), read back with
//!   `R8`/`R9`/`R10`
//! - Readings: `R0` setpoint, `R1`..`R3` sensors
//! - Heater: `H<sensor>`, `M<volts*10>` ceiling, `O<percent>` manual output
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use cryo_hardware::drivers::{Itc503, OxfordInstrument};
//! use cryo_hardware::transport::DeviceAddress;
//!
//! let mut itc = Itc503::new("Sorb ITC", DeviceAddress::isobus("/dev/ttyUSB0", 1));
//! itc.initialize().await?;
//! itc.set_temperature(1.5).await?;
//! let t = itc.get_temperature(2).await?;
//! ```

use async_trait::async_trait;
use cryo_core::error::{CryoError, CryoResult};
use cryo_core::tables::Pid;
use tracing::instrument;

use super::{parse_reading, ControlMode, DeviceStatus, OxfordInstrument, StatusWord};
use crate::transport::{DeviceAddress, OxfordTransport, Transport};

const STATUS_LEN: usize = 13;
const STATUS_MARKERS: [(usize, u8); 6] = [(0, b'X'), (2, b'A'), (4, b'C'), (6, b'S'), (9, b'H'), (11, b'L')];

/// Decoded `XnAnCnSnnHnLn` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItcStatus {
    /// Heater under automatic control.
    pub auto_heater: bool,
    /// Needle valve (gas) under automatic control.
    pub auto_gas: bool,
    /// Control mode.
    pub control: ControlMode,
    /// Sweep step code (0 = not sweeping).
    pub sweep: u8,
    /// Sensor driving the heater loop (1..=3).
    pub heater_sensor: u8,
    /// Instrument-internal PID table in use.
    pub auto_pid: bool,
}

impl Default for ItcStatus {
    fn default() -> Self {
        Self {
            auto_heater: false,
            auto_gas: false,
            control: ControlMode::LocalLocked,
            sweep: 0,
            heater_sensor: 1,
            auto_pid: false,
        }
    }
}

impl ItcStatus {
    /// Decodes a status payload (the reply to `X` after its echo).
    pub fn decode(device: &str, payload: &str) -> CryoResult<Self> {
        let word = StatusWord::parse(device, payload, STATUS_LEN, &STATUS_MARKERS)?;
        let (auto_heater, auto_gas) = match word.digit(3)? {
            0 => (false, false),
            1 => (true, false),
            2 => (false, true),
            3 => (true, true),
            other => return Err(word.malformed(format!("auto/manual code {} out of range", other))),
        };
        let control = ControlMode::from_digit(word.digit(5)?)
            .ok_or_else(|| word.malformed("control mode out of range"))?;
        let heater_sensor = word.digit(10)?;
        if !(1..=3).contains(&heater_sensor) {
            return Err(word.malformed(format!("heater sensor {} out of range", heater_sensor)));
        }
        let auto_pid = match word.digit(12)? {
            0 => false,
            1 => true,
            other => return Err(word.malformed(format!("auto-PID code {} out of range", other))),
        };
        Ok(Self {
            auto_heater,
            auto_gas,
            control,
            sweep: word.two_digits(7)?,
            heater_sensor,
            auto_pid,
        })
    }
}

/// Digit for the `A` command.
pub fn auto_status_digit(heater: bool, gas: bool) -> u8 {
    match (heater, gas) {
        (false, false) => 0,
        (true, false) => 1,
        (false, true) => 2,
        (true, true) => 3,
    }
}

/// Renders a setpoint for `T`: shortest decimal form, integral values with
/// one decimal, cut to four characters.
pub fn format_setpoint(temperature: f64) -> String {
    let mut text = if temperature.is_finite() && temperature.fract() == 0.0 {
        format!("{:.1}", temperature)
    } else {
        format!("{}", temperature)
    };
    text.truncate(4);
    text
}

fn check_sensor(sensor: u8) -> CryoResult<u8> {
    if (1..=3).contains(&sensor) {
        Ok(sensor)
    } else {
        Err(CryoError::InvalidParameter(format!(
            "ITC503 sensor must be 1, 2 or 3 (got {})",
            sensor
        )))
    }
}

/// ITC503 driver.
///
/// Keeps a cached copy of the instrument state that the thermal control
/// policy consults without extra round trips. The cache is refreshed by
/// [`OxfordInstrument::read_status`] and updated by every setter.
pub struct Itc503 {
    link: Box<dyn Transport>,
    status: ItcStatus,
    setpoint: f64,
    pid: Pid,
    temperatures: [f64; 3],
}

impl Itc503 {
    /// Driver that opens `address` through the shared line registry.
    pub fn new(name: impl Into<String>, address: DeviceAddress) -> Self {
        Self::with_transport(Box::new(OxfordTransport::new(name, address)))
    }

    /// Driver over an existing transport.
    pub fn with_transport(link: Box<dyn Transport>) -> Self {
        Self {
            link,
            status: ItcStatus::default(),
            setpoint: 0.0,
            pid: Pid::new(0.0, 0.0, 0.0),
            temperatures: [0.0; 3],
        }
    }

    /// Cached status.
    pub fn status(&self) -> ItcStatus {
        self.status
    }

    /// Cached `(heater auto, gas auto)`.
    pub fn auto_status(&self) -> (bool, bool) {
        (self.status.auto_heater, self.status.auto_gas)
    }

    /// Cached active heater sensor.
    pub fn heater_sensor(&self) -> u8 {
        self.status.heater_sensor
    }

    /// Cached auto-PID flag.
    pub fn auto_pid(&self) -> bool {
        self.status.auto_pid
    }

    /// Last setpoint written or read.
    pub fn cached_setpoint(&self) -> f64 {
        self.setpoint
    }

    /// Last PID written or read.
    pub fn cached_pid(&self) -> Pid {
        self.pid
    }

    /// Last readings of sensors 1..3.
    pub fn cached_temperatures(&self) -> [f64; 3] {
        self.temperatures
    }

    async fn read(&mut self, command: &str) -> CryoResult<f64> {
        let payload = self.link.send_receive(command).await?;
        parse_reading(self.link.device(), command, &payload)
    }

    /// Sets the control mode (`C`).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn set_control_mode(&mut self, mode: ControlMode) -> CryoResult<()> {
        self.link.send_receive(&mode.command()?).await?;
        self.status.control = mode;
        Ok(())
    }

    /// Puts the heater and needle valve in automatic or manual mode (`A`).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn set_auto_status(&mut self, heater: bool, gas: bool) -> CryoResult<()> {
        self.link
            .send_receive(&format!("A{}", auto_status_digit(heater, gas)))
            .await?;
        self.status.auto_heater = heater;
        self.status.auto_gas = gas;
        Ok(())
    }

    /// Proportional band in K.
    pub async fn set_p(&mut self, p: f64) -> CryoResult<()> {
        self.link.send_receive(&format!("P{:.3}", p)).await?;
        self.pid.p = p;
        Ok(())
    }

    /// Integral action time in minutes.
    pub async fn set_i(&mut self, i: f64) -> CryoResult<()> {
        self.link.send_receive(&format!("I{:.1}", i)).await?;
        self.pid.i = i;
        Ok(())
    }

    /// Derivative action time in minutes.
    pub async fn set_d(&mut self, d: f64) -> CryoResult<()> {
        self.link.send_receive(&format!("D{:.1}", d)).await?;
        self.pid.d = d;
        Ok(())
    }

    /// Writes P, I and D in that order.
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn set_pid(&mut self, pid: Pid) -> CryoResult<()> {
        self.set_p(pid.p).await?;
        self.set_i(pid.i).await?;
        self.set_d(pid.d).await
    }

    /// Selects the sensor that drives the heater loop (`H`).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn set_heater_sensor(&mut self, sensor: u8) -> CryoResult<()> {
        let sensor = check_sensor(sensor)?;
        self.link.send_receive(&format!("H{}", sensor)).await?;
        self.status.heater_sensor = sensor;
        Ok(())
    }

    /// Enables or disables the instrument's PID table (`L`).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn toggle_auto_pid(&mut self, enabled: bool) -> CryoResult<()> {
        self.link
            .send_receive(if enabled { "L1" } else { "L0" })
            .await?;
        self.status.auto_pid = enabled;
        Ok(())
    }

    /// Sets the target temperature of the active sensor (`T`).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn set_temperature(&mut self, temperature: f64) -> CryoResult<()> {
        self.link
            .send_receive(&format!("T{}", format_setpoint(temperature)))
            .await?;
        self.setpoint = temperature;
        Ok(())
    }

    /// Heater voltage ceiling (`M`, tenths of a volt).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn set_maximum_heater_voltage(&mut self, volts: f64) -> CryoResult<()> {
        let tenths = (volts * 10.0).trunc() as i64;
        self.link.send_receive(&format!("M{}", tenths)).await?;
        Ok(())
    }

    /// Manual heater output in percent of range (`O`).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn set_heater_output(&mut self, percent: f64) -> CryoResult<()> {
        self.link.send_receive(&format!("O{:.6}", percent)).await?;
        Ok(())
    }

    /// Reads the PID in use (`R8`, `R9`, `R10`).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn get_pid(&mut self) -> CryoResult<Pid> {
        let p = self.read("R8").await?;
        let i = self.read("R9").await?;
        let d = self.read("R10").await?;
        self.pid = Pid::new(p, i, d);
        Ok(self.pid)
    }

    /// Reads the setpoint (`R0`).
    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    pub async fn get_setpoint(&mut self) -> CryoResult<f64> {
        self.setpoint = self.read("R0").await?;
        Ok(self.setpoint)
    }

    /// Reads one sensor (`R1`..`R3`).
    pub async fn get_temperature(&mut self, sensor: u8) -> CryoResult<f64> {
        let sensor = check_sensor(sensor)?;
        let value = self.read(&format!("R{}", sensor)).await?;
        self.temperatures[usize::from(sensor - 1)] = value;
        Ok(value)
    }

    /// Reads all three sensors in order.
    pub async fn get_temperatures(&mut self) -> CryoResult<[f64; 3]> {
        for sensor in 1..=3 {
            self.get_temperature(sensor).await?;
        }
        Ok(self.temperatures)
    }

    /// Reads and caches the status word.
    pub async fn refresh_status(&mut self) -> CryoResult<ItcStatus> {
        let payload = self.link.send_receive("X").await?;
        self.status = ItcStatus::decode(self.link.device(), &payload)?;
        Ok(self.status)
    }
}

#[async_trait]
impl OxfordInstrument for Itc503 {
    fn name(&self) -> &str {
        self.link.device()
    }

    #[instrument(skip(self), fields(device = %self.link.device()), err)]
    async fn initialize(&mut self) -> CryoResult<()> {
        self.link.open().await?;
        self.set_control_mode(ControlMode::RemoteUnlocked).await?;
        self.set_auto_status(true, true).await?;
        self.get_pid().await?;
        self.get_temperatures().await?;
        self.refresh_status().await?;
        tracing::info!(device = %self.link.device(), status = ?self.status, "ITC503 initialized");
        Ok(())
    }

    async fn communicate(&mut self, command: &str) -> CryoResult<String> {
        self.link.send_receive(command).await
    }

    async fn read_status(&mut self) -> CryoResult<DeviceStatus> {
        Ok(DeviceStatus::Temperature(self.refresh_status().await?))
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

    fn mock_itc() -> (Itc503, mock_serial::MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let link = OxfordTransport::with_port("ITC503", DeviceAddress::isobus("mock", 1), wrap_shared(Box::new(port)));
        (Itc503::with_transport(Box::new(link)), harness)
    }

    #[test]
    fn test_status_decode() {
        let status = ItcStatus::decode("ITC503", "0A1C3S04H2L1").unwrap();
        assert!(status.auto_heater);
        assert!(!status.auto_gas);
        assert_eq!(status.control, ControlMode::RemoteUnlocked);
        assert_eq!(status.sweep, 4);
        assert_eq!(status.heater_sensor, 2);
        assert!(status.auto_pid);
    }

    #[test]
    fn test_status_decode_rejects_bad_columns() {
        assert!(matches!(
            ItcStatus::decode("ITC503", "0A1C3S04H4L1"),
            Err(CryoError::MalformedStatusReply { .. })
        ));
        assert!(ItcStatus::decode("ITC503", "0A1C3S04H2").is_err());
        assert!(ItcStatus::decode("ITC503", "0B1C3S04H2L1").is_err());
    }

    #[test]
    fn test_auto_status_digits() {
        assert_eq!(auto_status_digit(false, false), 0);
        assert_eq!(auto_status_digit(true, false), 1);
        assert_eq!(auto_status_digit(false, true), 2);
        assert_eq!(auto_status_digit(true, true), 3);
    }

    #[test]
    fn test_setpoint_formatting() {
        assert_eq!(format_setpoint(1.5), "1.5");
        assert_eq!(format_setpoint(0.3), "0.3");
        assert_eq!(format_setpoint(1.23456), "1.23");
        assert_eq!(format_setpoint(10.0), "10.0");
        assert_eq!(format_setpoint(300.0), "300.");
        assert_eq!(format_setpoint(0.0), "0.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pid_and_heater_commands() {
        let (mut itc, mut harness) = mock_itc();
        itc.link.open().await.unwrap();

        let task = tokio::spawn(async move {
            itc.set_pid(Pid::new(1.5, 2.0, 0.5)).await.unwrap();
            itc.set_maximum_heater_voltage(4.27).await.unwrap();
            itc.set_heater_output(0.0).await.unwrap();
            itc.set_heater_sensor(3).await.unwrap();
            itc
        });
        harness.expect_and_respond(b"@1P1.500\r", b"@1P1.500\r").await;
        harness.expect_and_respond(b"@1I2.0\r", b"@1I2.0\r").await;
        harness.expect_and_respond(b"@1D0.5\r", b"@1D0.5\r").await;
        harness.expect_and_respond(b"@1M42\r", b"@1M42\r").await;
        harness.expect_and_respond(b"@1O0.000000\r", b"@1O0.000000\r").await;
        harness.expect_and_respond(b"@1H3\r", b"@1H3\r").await;
        let itc = task.await.unwrap();
        assert_eq!(itc.heater_sensor(), 3);
        assert_eq!(itc.cached_pid(), Pid::new(1.5, 2.0, 0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_sequence() {
        let (mut itc, mut harness) = mock_itc();
        let task = tokio::spawn(async move {
            itc.initialize().await.unwrap();
            itc
        });
        harness.expect_and_respond(b"@1C3\r", b"@1C3\r").await;
        harness.expect_and_respond(b"@1A3\r", b"@1A3\r").await;
        harness.expect_and_respond(b"@1R8\r", b"@1R82.0\r").await;
        harness.expect_and_respond(b"@1R9\r", b"@1R91.0\r").await;
        harness.expect_and_respond(b"@1R10\r", b"@1R100.0\r").await;
        harness.expect_and_respond(b"@1R1\r", b"@1R1+4.20\r").await;
        harness.expect_and_respond(b"@1R2\r", b"@1R2+30.1\r").await;
        harness.expect_and_respond(b"@1R3\r", b"@1R3+0.500\r").await;
        harness.expect_and_respond(b"@1X\r", b"@1X0A3C3S00H2L0\r").await;
        let itc = task.await.unwrap();
        assert_eq!(itc.cached_temperatures(), [4.2, 30.1, 0.5]);
        assert_eq!(itc.cached_pid(), Pid::new(2.0, 1.0, 0.0));
        assert_eq!(itc.heater_sensor(), 2);
        assert_eq!(itc.auto_status(), (true, true));
    }

    #[tokio::test]
    async fn test_sensor_out_of_range() {
        let (mut itc, _harness) = mock_itc();
        assert!(matches!(itc.get_temperature(4).await, Err(CryoError::InvalidParameter(_))));
    }
}

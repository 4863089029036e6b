//! Shared pieces of the IPS120 and PS120 magnet power supply drivers.
//!
//! Both supplies answer `X` with `XmnAnCnHnMmnPmn`:
//!
//! | Column | Meaning |
//! |--------|---------|
//! | 1, 2   | system status 1 and 2 |
//! | 4      | activity (0 hold, 1 to setpoint, 2 to zero, 4 clamped) |
//! | 6      | control mode |
//! | 8      | switch heater (0 off at zero, 1 on, 2 off at field, 5 fault, 8 none) |
//! | 10, 11 | mode 1 (units/speed) and mode 2 (sweeping/rate limiting) |
//! | 13, 14 | polarity 1 (desired/magnet/commanded) and polarity 2 (contactors) |
//!
//! The variants differ only in field units and sign handling, so the shared
//! commands live on [`MagnetSupply`] as default methods over a
//! [`SupplyLink`].

use async_trait::async_trait;
use cryo_core::error::{CryoError, CryoResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ControlMode, OxfordInstrument, StatusWord};
use crate::transport::Transport;

const STATUS_LEN: usize = 15;
const STATUS_MARKERS: [(usize, u8); 6] = [(0, b'X'), (3, b'A'), (5, b'C'), (7, b'H'), (9, b'M'), (12, b'P')];

/// Shortest switch heater settle time the supplies tolerate.
pub const MIN_SWITCH_HEATER_DELAY: Duration = Duration::from_secs(15);
/// Switch heater settle time used at bring-up.
pub const DEFAULT_SWITCH_HEATER_DELAY: Duration = Duration::from_secs(20);

/// Supply model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplyModel {
    /// IPS120: fields in tesla, signed.
    #[default]
    Ips120,
    /// PS120: fields in millitesla, sign from the polarity flags.
    Ps120,
}

impl SupplyModel {
    /// The target the supply will actually sweep to when asked for `tesla`,
    /// rounded exactly as the `J` argument is formatted.
    pub fn quantize_field(self, tesla: f64) -> f64 {
        let quantized = match self {
            SupplyModel::Ips120 => format!("{:.4}", tesla).parse().unwrap_or(tesla),
            SupplyModel::Ps120 => (tesla * 1000.0).abs().round().copysign(tesla) / 1000.0,
        };
        if quantized == 0.0 {
            0.0
        } else {
            quantized
        }
    }
}

/// Output activity (`A` command, `An` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Hold the present output.
    Hold,
    /// Sweep to the setpoint.
    ToSetpoint,
    /// Sweep to zero.
    ToZero,
    /// Output clamped.
    Clamped,
}

impl Activity {
    /// Protocol digit.
    pub fn digit(self) -> u8 {
        match self {
            Activity::Hold => 0,
            Activity::ToSetpoint => 1,
            Activity::ToZero => 2,
            Activity::Clamped => 4,
        }
    }

    /// Decodes a status digit.
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(Activity::Hold),
            1 => Some(Activity::ToSetpoint),
            2 => Some(Activity::ToZero),
            4 => Some(Activity::Clamped),
            _ => None,
        }
    }
}

/// Switch heater state reported in the `Hn` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchHeaterState {
    /// Off, magnet at zero (switch closed).
    OffAtZero,
    /// On (switch open).
    On,
    /// Off, magnet at field (switch closed).
    OffAtField,
    /// Heater on but current low.
    Fault,
    /// No switch fitted.
    NotFitted,
}

impl SwitchHeaterState {
    fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(SwitchHeaterState::OffAtZero),
            1 => Some(SwitchHeaterState::On),
            2 => Some(SwitchHeaterState::OffAtField),
            5 => Some(SwitchHeaterState::Fault),
            8 => Some(SwitchHeaterState::NotFitted),
            _ => None,
        }
    }
}

/// Switch heater command (`H`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchHeaterCommand {
    /// Heater off.
    Off,
    /// Heater on only if supply and magnet currents match.
    OnIfCurrentsMatch,
    /// Heater on unconditionally.
    ForceOn,
}

impl SwitchHeaterCommand {
    fn digit(self) -> u8 {
        match self {
            SwitchHeaterCommand::Off => 0,
            SwitchHeaterCommand::OnIfCurrentsMatch => 1,
            SwitchHeaterCommand::ForceOn => 2,
        }
    }
}

/// Polarity command (`P`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolarityCommand {
    /// No action.
    NoAction,
    /// Forward.
    Forward,
    /// Reverse.
    Reverse,
    /// Swap.
    Swap,
}

impl PolarityCommand {
    fn digit(self) -> u8 {
        match self {
            PolarityCommand::NoAction => 0,
            PolarityCommand::Forward => 1,
            PolarityCommand::Reverse => 2,
            PolarityCommand::Swap => 4,
        }
    }
}

/// Decoded `XmnAnCnHnMmnPmn` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagnetStatus {
    /// System status 1 (0 normal, 1 quenched, 2 over-heated, 4 warming, 8 fault).
    pub system1: u8,
    /// System status 2 (voltage and current limits).
    pub system2: u8,
    /// Output activity.
    pub activity: Activity,
    /// Control mode.
    pub control: ControlMode,
    /// Switch heater.
    pub switch_heater: SwitchHeaterState,
    /// Mode 1 (units and sweep speed).
    pub mode1: u8,
    /// Mode 2 (at rest, sweeping, rate limiting).
    pub mode2: u8,
    /// Polarity 1 (desired/magnet/commanded signs, bit 2 set = setpoint negative).
    pub polarity1: u8,
    /// Polarity 2 (contactor verification).
    pub polarity2: u8,
}

impl MagnetStatus {
    /// Decodes a status payload (the reply to `X` after its echo).
    pub fn decode(device: &str, payload: &str) -> CryoResult<Self> {
        let word = StatusWord::parse(device, payload, STATUS_LEN, &STATUS_MARKERS)?;
        let activity = Activity::from_digit(word.digit(4)?)
            .ok_or_else(|| word.malformed("activity code out of range"))?;
        let control = ControlMode::from_digit(word.digit(6)?)
            .ok_or_else(|| word.malformed("control mode out of range"))?;
        let switch_heater = SwitchHeaterState::from_digit(word.digit(8)?)
            .ok_or_else(|| word.malformed("switch heater code out of range"))?;
        Ok(Self {
            system1: word.digit(1)?,
            system2: word.digit(2)?,
            activity,
            control,
            switch_heater,
            mode1: word.digit(10)?,
            mode2: word.digit(11)?,
            polarity1: word.digit(13)?,
            polarity2: word.digit(14)?,
        })
    }

    /// Output is currently changing.
    pub fn is_sweeping(&self) -> bool {
        matches!(self.mode2, 1 | 3)
    }
}

/// Transport plus the cached status word of one supply.
pub struct SupplyLink {
    link: Box<dyn Transport>,
    status: Option<MagnetStatus>,
}

impl SupplyLink {
    /// Wraps a transport.
    pub fn new(link: Box<dyn Transport>) -> Self {
        Self { link, status: None }
    }

    /// Device name.
    pub fn device(&self) -> &str {
        self.link.device()
    }

    /// Last decoded status.
    pub fn cached_status(&self) -> Option<MagnetStatus> {
        self.status
    }

    /// Opens the underlying transport.
    pub async fn open(&mut self) -> CryoResult<()> {
        self.link.open().await
    }

    /// Closes the underlying transport.
    pub async fn close(&mut self) -> CryoResult<()> {
        self.link.close().await
    }

    /// One raw transaction.
    pub async fn communicate(&mut self, command: &str) -> CryoResult<String> {
        self.link.send_receive(command).await
    }

    /// Sends a read command and parses the numeric payload.
    pub async fn read(&mut self, command: &str) -> CryoResult<f64> {
        let payload = self.link.send_receive(command).await?;
        super::parse_reading(self.link.device(), command, &payload)
    }

    /// Reads, decodes and caches the status word.
    pub async fn refresh_status(&mut self) -> CryoResult<MagnetStatus> {
        let payload = self.link.send_receive("X").await?;
        let status = MagnetStatus::decode(self.link.device(), &payload)?;
        self.status = Some(status);
        Ok(status)
    }

    /// Cached status, reading it first if nothing is cached yet.
    pub async fn status_or_refresh(&mut self) -> CryoResult<MagnetStatus> {
        match self.status {
            Some(status) => Ok(status),
            None => self.refresh_status().await,
        }
    }
}

/// Magnet power supply operations shared by both models.
#[async_trait]
pub trait MagnetSupply: OxfordInstrument {
    /// Supply model.
    fn model(&self) -> SupplyModel;

    /// Link and status cache.
    fn supply_link(&mut self) -> &mut SupplyLink;

    /// Sets the field target in tesla and starts sweeping to it.
    async fn set_field(&mut self, tesla: f64) -> CryoResult<()>;

    /// Sets the sweep rate in tesla/min.
    async fn set_sweep_rate(&mut self, tesla_per_min: f64) -> CryoResult<()>;

    /// Output field in tesla.
    async fn get_field(&mut self) -> CryoResult<f64>;

    /// Field target in tesla.
    async fn get_field_setpoint(&mut self) -> CryoResult<f64>;

    /// Sweep rate in tesla/min.
    async fn get_sweep_rate(&mut self) -> CryoResult<f64>;

    /// Sets the control mode (`C`).
    async fn set_control_mode(&mut self, mode: ControlMode) -> CryoResult<()> {
        let command = mode.command()?;
        self.supply_link().communicate(&command).await?;
        Ok(())
    }

    /// Sets the output activity (`A`).
    async fn set_activity(&mut self, activity: Activity) -> CryoResult<()> {
        let link = self.supply_link();
        link.communicate(&format!("A{}", activity.digit())).await?;
        if let Some(status) = link.status.as_mut() {
            status.activity = activity;
        }
        Ok(())
    }

    /// Sends a polarity command (`P`).
    async fn set_polarity(&mut self, polarity: PolarityCommand) -> CryoResult<()> {
        self.supply_link()
            .communicate(&format!("P{}", polarity.digit()))
            .await?;
        Ok(())
    }

    /// Sets the sweep mode word (`M`, 0..=9).
    async fn set_sweep_mode(&mut self, mode: u8) -> CryoResult<()> {
        if mode > 9 {
            return Err(CryoError::InvalidParameter(format!(
                "sweep mode must be a single digit (got {})",
                mode
            )));
        }
        self.supply_link().communicate(&format!("M{}", mode)).await?;
        Ok(())
    }

    /// Commands the persistent switch heater, blocks for `delay`, then
    /// re-reads the status.
    ///
    /// # Errors
    /// `InvalidParameter` when `delay` is shorter than 15 s; nothing is sent.
    async fn set_switch_heater(&mut self, command: SwitchHeaterCommand, delay: Duration) -> CryoResult<()> {
        if delay < MIN_SWITCH_HEATER_DELAY {
            return Err(CryoError::InvalidParameter(format!(
                "switch heater delay must be at least {:?} (got {:?})",
                MIN_SWITCH_HEATER_DELAY, delay
            )));
        }
        let link = self.supply_link();
        link.communicate(&format!("H{}", command.digit())).await?;
        tracing::debug!(device = %link.device(), ?command, ?delay, "Waiting for switch heater");
        tokio::time::sleep(delay).await;
        link.refresh_status().await?;
        Ok(())
    }

    /// Reads and decodes the status word.
    async fn get_status(&mut self) -> CryoResult<MagnetStatus> {
        self.supply_link().refresh_status().await
    }

    /// Output activity, from the cached status when one has been read.
    async fn get_activity(&mut self) -> CryoResult<Activity> {
        Ok(self.supply_link().status_or_refresh().await?.activity)
    }
}

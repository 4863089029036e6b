//! Configuration for the vector magnet and He3 insert.
//!
//! Configuration is loaded from:
//! 1. `config/cryomag.toml` (or an explicit path)
//! 2. Environment variables prefixed with `CRYOMAG_`, nested keys separated
//!    by `__` (e.g. `CRYOMAG_MAGNET__RAMP_PROPORTION=0.5`)
//!
//! Loading never touches hardware. [`CryomagConfig::validate`] reports every
//! problem it finds as one `CryoError::Configuration` before any port is
//! opened.
//!
//! # Example
//! ```no_run
//! use cryomag::config::CryomagConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = CryomagConfig::load()?;
//! println!("ramp limits: {:?}", config.magnet.ramp_limits);
//! # Ok(())
//! # }
//! ```

use anyhow::Context;
use cryo_core::error::{CryoError, CryoResult};
use cryo_core::tables::{Pid, PidLookup, PidTable, StabilityTable};
use cryo_hardware::drivers::magnet::{SupplyModel, MIN_SWITCH_HEATER_DELAY};
use cryo_hardware::transport::DeviceAddress;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::coordinator::ReadMode;
use crate::logging::OutputFormat;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/cryomag.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryomagConfig {
    /// Log output
    #[serde(default)]
    pub logging: LogSettings,
    /// Magnet power supplies and ramp limits
    pub magnet: MagnetConfig,
    /// The three ITC503 controllers, indexed by sensor bindings
    pub controllers: Vec<ControllerConfig>,
    /// Gas-handling valve V1
    pub valve: ValveConfig,
    /// Thermal node bindings
    pub sensors: SensorsConfig,
    /// Procedure constants
    pub control: ControlConfig,
    /// Background status monitor
    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default)]
    pub format: OutputFormat,
    /// Emit span open/close events
    #[serde(default)]
    pub span_events: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
            span_events: false,
        }
    }
}

/// `[magnet]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagnetConfig {
    /// Maximum sweep rate per axis (T/min)
    #[serde(default = "default_ramp_limits")]
    pub ramp_limits: [f64; 3],
    /// Fraction of the limits actually used, 0 < p <= 1
    #[serde(default = "default_ramp_proportion")]
    pub ramp_proportion: f64,
    /// Whether getters query the supplies or return cached values
    #[serde(default)]
    pub read_mode: ReadMode,
    /// Settle time for the persistent switch heaters at bring-up
    #[serde(default = "default_switch_heater_delay")]
    pub switch_heater_delay_secs: u64,
    /// x, y and z supplies, in axis order
    pub supplies: Vec<SupplyConfig>,
}

impl MagnetConfig {
    /// Switch heater settle time.
    pub fn switch_heater_delay(&self) -> Duration {
        Duration::from_secs(self.switch_heater_delay_secs)
    }
}

/// One magnet supply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyConfig {
    /// Name used in logs
    pub name: String,
    /// ips120 or ps120
    #[serde(default)]
    pub model: SupplyModel,
    /// Where the supply lives
    #[serde(flatten)]
    pub address: DeviceAddress,
}

/// One temperature controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name used in logs
    pub name: String,
    /// Where the controller lives
    #[serde(flatten)]
    pub address: DeviceAddress,
}

/// `[valve]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveConfig {
    /// Name used in logs
    #[serde(default = "default_valve_name")]
    pub name: String,
    /// Where the valve controller lives
    #[serde(flatten)]
    pub address: DeviceAddress,
    /// Valve channel (single digit)
    #[serde(default = "default_valve_channel")]
    pub channel: u8,
    /// Whether the valve closes when unpowered
    #[serde(default = "default_true")]
    pub normally_closed: bool,
}

/// A thermal node: which controller and sensor read it, and how its heater
/// loop is tuned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorBinding {
    /// Index into `controllers`
    pub controller: usize,
    /// Sensor channel on that controller (1..=3)
    pub sensor: u8,
    /// PID table as `{ upper, p, i, d }` rows
    #[serde(default)]
    pub pid_table: Option<PidTable>,
    /// Fixed PID, used when no table is given
    #[serde(default)]
    pub pid: Option<Pid>,
    /// Heater voltage ceiling applied when the loop switches to this sensor
    #[serde(default)]
    pub heater_limit: Option<f64>,
    /// Highest temperature the sensor reads reliably
    #[serde(default)]
    pub max_temp: Option<f64>,
    /// Setpoint used when the node's heater is switched on
    #[serde(default)]
    pub setpoint_on: Option<f64>,
    /// Temperature below which the node counts as off
    #[serde(default)]
    pub off_temp: Option<f64>,
    /// Setpoint sweep rate (K/min); absent means setpoints are stepped
    #[serde(default)]
    pub sweep_rate: Option<f64>,
}

impl SensorBinding {
    /// PID to use for `setpoint`: the table row, else the fixed PID.
    pub fn pid_for(&self, setpoint: f64) -> PidLookup {
        match (&self.pid_table, self.pid) {
            (Some(table), _) => table.lookup(setpoint),
            (None, Some(pid)) => PidLookup { found: true, pid },
            (None, None) => PidLookup {
                found: false,
                pid: Pid::new(0.0, 0.0, 0.0),
            },
        }
    }
}

/// `[sensors.*]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorsConfig {
    /// He3 sorption pump
    pub he3_sorb: SensorBinding,
    /// He3 pot, low-range sensor
    pub he3_pot_low: SensorBinding,
    /// He3 pot, high-range sensor
    pub he3_pot_high: SensorBinding,
    /// Gas-gap heat switch
    pub heat_switch: SensorBinding,
    /// First pulse-tube stage
    pub pt1_plate: SensorBinding,
    /// Second pulse-tube stage
    pub pt2_plate: SensorBinding,
    /// Intermediate plate
    pub int_plate: SensorBinding,
    /// Magnet body
    pub magnet: SensorBinding,
}

/// `[control.*]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Run-to-temperature
    pub temperature: TemperatureControl,
    /// Initial cooldown
    pub cooldown: CooldownControl,
    /// Precondense
    pub precondense: PrecondenseControl,
    /// Condense
    pub condense: CondenseControl,
}

/// `[control.temperature]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureControl {
    /// Below this the low-range loop drives the pot and V1 stays closed;
    /// also the recondense cutoff.
    pub he3_upper_temp: f64,
    /// Above this (and below `he3_upper_temp`) the heat switch is held at
    /// `low_hs_tset` instead of fully on or off.
    pub he3_low_lim_low_hs_tset: f64,
    /// Heat switch setpoint for the intermediate band
    pub low_hs_tset: f64,
    /// Targets this far below the current He3 temperature trigger a cooldown
    #[serde(default = "default_cooldown_delta")]
    pub cooldown_delta: f64,
    /// Settle time after the stability wait
    #[serde(default)]
    pub delay_before_stable_secs: f64,
    /// Allowed deviation by temperature band
    pub stability_table: StabilityTable,
}

/// `[control.cooldown]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownControl {
    /// Pre-cool ends once the high-range pot sensor is below this
    pub precool_final_he3_temp: f64,
    /// Sorb temperature to reach before closing V1
    pub sorb_target: f64,
    /// Trend tolerance for the initial He3 stabilisation (K/s)
    pub he3_stability_initial: f64,
}

/// `[control.precondense]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecondenseControl {
    /// Sorb temperature to reach with V1 open
    pub sorb_target: f64,
    /// Hold time before closing V1
    #[serde(default)]
    pub delay_secs: f64,
}

/// `[control.condense]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondenseControl {
    /// Sorb setpoint while condensing
    pub sorb_setpoint: f64,
    /// Intermediate sorb setpoint before the sweep
    pub sorb_sweep_start: f64,
    /// Sorb temperature at the end of the sweep
    pub sorb_sweep_end: f64,
    /// He3 trend tolerance (K/s)
    pub he3_stability: f64,
    /// Hold time after the pot stabilises
    #[serde(default)]
    pub delay_secs: f64,
    /// How long V1 stays open at the end
    #[serde(default)]
    pub v1_open_time_secs: f64,
}

/// `[monitor]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll period in milliseconds
    #[serde(default = "default_monitor_period")]
    pub period_ms: u64,
    /// Snapshots buffered per subscriber
    #[serde(default = "default_monitor_capacity")]
    pub capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period_ms: default_monitor_period(),
            capacity: default_monitor_capacity(),
        }
    }
}

impl MonitorConfig {
    /// Poll period.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_ramp_limits() -> [f64; 3] {
    [0.25, 0.125, 0.125]
}

fn default_ramp_proportion() -> f64 {
    1.0
}

fn default_switch_heater_delay() -> u64 {
    20
}

fn default_valve_name() -> String {
    "Valve".to_string()
}

fn default_valve_channel() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

fn default_cooldown_delta() -> f64 {
    25.0
}

fn default_monitor_period() -> u64 {
    500
}

fn default_monitor_capacity() -> usize {
    64
}

/// Seconds from configuration as a `Duration`; negative or invalid values
/// become zero.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

impl CryomagConfig {
    /// Loads `config/cryomag.toml` plus `CRYOMAG_` environment overrides and
    /// validates the result.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads a specific file plus `CRYOMAG_` environment overrides and
    /// validates the result.
    pub fn load_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CRYOMAG_").split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Parses a TOML string without environment overrides.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::string(text))
            .extract()
            .context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Bindings by node, in the order the monitor reports them.
    pub fn bindings(&self) -> [(&'static str, &SensorBinding); 8] {
        let s = &self.sensors;
        [
            ("he3_sorb", &s.he3_sorb),
            ("he3_pot_low", &s.he3_pot_low),
            ("he3_pot_high", &s.he3_pot_high),
            ("heat_switch", &s.heat_switch),
            ("pt1_plate", &s.pt1_plate),
            ("pt2_plate", &s.pt2_plate),
            ("int_plate", &s.int_plate),
            ("magnet", &s.magnet),
        ]
    }

    /// Checks everything that can be checked without hardware.
    ///
    /// All problems are collected into a single error message.
    pub fn validate(&self) -> CryoResult<()> {
        let mut problems = Vec::new();

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            problems.push(format!(
                "invalid log level '{}', expected one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let magnet = &self.magnet;
        if magnet.supplies.len() != 3 {
            problems.push(format!(
                "expected 3 magnet supplies, found {}",
                magnet.supplies.len()
            ));
        }
        for supply in &magnet.supplies {
            if let Err(e) = supply.address.validate() {
                problems.push(format!("supply '{}': {}", supply.name, e));
            }
        }
        for (axis, limit) in magnet.ramp_limits.iter().enumerate() {
            if !(limit.is_finite() && *limit > 0.0) {
                problems.push(format!("ramp limit for axis {} must be positive (got {})", axis, limit));
            }
        }
        if !(magnet.ramp_proportion > 0.0 && magnet.ramp_proportion <= 1.0) {
            problems.push(format!(
                "ramp proportion must be in (0, 1] (got {})",
                magnet.ramp_proportion
            ));
        }
        if magnet.switch_heater_delay() < MIN_SWITCH_HEATER_DELAY {
            problems.push(format!(
                "switch heater delay must be at least {} s (got {})",
                MIN_SWITCH_HEATER_DELAY.as_secs(),
                magnet.switch_heater_delay_secs
            ));
        }

        if self.controllers.len() != 3 {
            problems.push(format!(
                "expected 3 temperature controllers, found {}",
                self.controllers.len()
            ));
        }
        for controller in &self.controllers {
            if let Err(e) = controller.address.validate() {
                problems.push(format!("controller '{}': {}", controller.name, e));
            }
        }

        if let Err(e) = self.valve.address.validate() {
            problems.push(format!("valve: {}", e));
        }
        if self.valve.channel > 9 {
            problems.push(format!(
                "valve channel must be a single digit (got {})",
                self.valve.channel
            ));
        }

        for (node, binding) in self.bindings() {
            if binding.controller >= 3 {
                problems.push(format!(
                    "sensor '{}' refers to controller {} (expected 0, 1 or 2)",
                    node, binding.controller
                ));
            }
            if !(1..=3).contains(&binding.sensor) {
                problems.push(format!(
                    "sensor '{}' has channel {} (expected 1, 2 or 3)",
                    node, binding.sensor
                ));
            }
        }
        let s = &self.sensors;
        for (node, binding) in [("heat_switch", &s.heat_switch), ("pt2_plate", &s.pt2_plate)] {
            if binding.setpoint_on.is_none() {
                problems.push(format!("sensor '{}' needs setpoint_on", node));
            }
        }
        if s.heat_switch.off_temp.is_none() {
            problems.push("sensor 'heat_switch' needs off_temp".to_string());
        }
        if s.he3_pot_low.max_temp.is_none() {
            problems.push("sensor 'he3_pot_low' needs max_temp".to_string());
        }
        if let Some(rate) = s.he3_sorb.sweep_rate {
            if !(rate.is_finite() && rate != 0.0) {
                problems.push(format!("sensor 'he3_sorb' sweep_rate must be non-zero (got {})", rate));
            }
        }

        if self.monitor.period_ms == 0 {
            problems.push("monitor period must be positive".to_string());
        }
        if self.monitor.capacity == 0 {
            problems.push("monitor capacity must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CryoError::Configuration(problems.join("; ")))
        }
    }
}

//! Thermal nodes of the He3 insert and heater/PID selection.

use std::fmt;

use cryo_core::error::{CryoError, CryoResult};
use cryo_core::tables::Pid;
use cryo_hardware::drivers::Itc503;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::cluster::Devices;
use super::VectorMagnet;
use crate::config::{SensorBinding, SensorsConfig};

/// A temperature the coordinator reads or regulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalNode {
    /// He3 pot, read on the low-range sensor while it is in range and on
    /// the high-range sensor above that. Has no single heater binding.
    He3Pot,
    /// He3 sorption pump
    He3Sorb,
    /// He3 pot, low-range sensor
    He3PotLow,
    /// He3 pot, high-range sensor
    He3PotHigh,
    /// Gas-gap heat switch
    HeatSwitch,
    /// First pulse-tube stage
    Pt1Plate,
    /// Second pulse-tube stage
    Pt2Plate,
    /// Intermediate plate
    IntPlate,
    /// Magnet body
    Magnet,
}

impl ThermalNode {
    /// Log label.
    pub fn label(self) -> &'static str {
        match self {
            ThermalNode::He3Pot => "he3_pot",
            ThermalNode::He3Sorb => "he3_sorb",
            ThermalNode::He3PotLow => "he3_pot_low",
            ThermalNode::He3PotHigh => "he3_pot_high",
            ThermalNode::HeatSwitch => "heat_switch",
            ThermalNode::Pt1Plate => "pt1_plate",
            ThermalNode::Pt2Plate => "pt2_plate",
            ThermalNode::IntPlate => "int_plate",
            ThermalNode::Magnet => "magnet",
        }
    }

    /// Sensor binding of this node, `None` for [`ThermalNode::He3Pot`].
    pub fn binding(self, sensors: &SensorsConfig) -> Option<&SensorBinding> {
        Some(match self {
            ThermalNode::He3Pot => return None,
            ThermalNode::He3Sorb => &sensors.he3_sorb,
            ThermalNode::He3PotLow => &sensors.he3_pot_low,
            ThermalNode::He3PotHigh => &sensors.he3_pot_high,
            ThermalNode::HeatSwitch => &sensors.heat_switch,
            ThermalNode::Pt1Plate => &sensors.pt1_plate,
            ThermalNode::Pt2Plate => &sensors.pt2_plate,
            ThermalNode::IntPlate => &sensors.int_plate,
            ThermalNode::Magnet => &sensors.magnet,
        })
    }

    fn heater_binding(self, sensors: &SensorsConfig) -> CryoResult<&SensorBinding> {
        self.binding(sensors).ok_or_else(|| {
            CryoError::InvalidParameter(format!(
                "{} has no heater of its own; use he3_pot_low or he3_pot_high",
                self
            ))
        })
    }
}

impl fmt::Display for ThermalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One reading of every node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    /// He3 pot (range-selected)
    pub he3_pot: f64,
    /// Sorption pump
    pub he3_sorb: f64,
    /// Heat switch
    pub heat_switch: f64,
    /// PT1 plate
    pub pt1_plate: f64,
    /// PT2 plate
    pub pt2_plate: f64,
    /// Intermediate plate
    pub int_plate: f64,
    /// Magnet
    pub magnet: f64,
}

fn controller<'a>(devices: &'a mut Devices, binding: &SensorBinding) -> CryoResult<&'a mut Itc503> {
    devices
        .controllers
        .get_mut(binding.controller)
        .ok_or_else(|| CryoError::Configuration(format!("no temperature controller {}", binding.controller)))
}

pub(crate) async fn read_binding(devices: &mut Devices, binding: &SensorBinding) -> CryoResult<f64> {
    controller(devices, binding)?.get_temperature(binding.sensor).await
}

/// Range-selected He3 pot temperature.
pub(crate) async fn read_he3(devices: &mut Devices, sensors: &SensorsConfig) -> CryoResult<f64> {
    let low = read_binding(devices, &sensors.he3_pot_low).await?;
    let max_low = sensors.he3_pot_low.max_temp.unwrap_or(f64::INFINITY);
    if low <= max_low {
        Ok(low)
    } else {
        read_binding(devices, &sensors.he3_pot_high).await
    }
}

pub(crate) async fn read_node(devices: &mut Devices, sensors: &SensorsConfig, node: ThermalNode) -> CryoResult<f64> {
    match node.binding(sensors) {
        Some(binding) => read_binding(devices, binding).await,
        None => read_he3(devices, sensors).await,
    }
}

/// Requests `setpoint` on a binding's sensor.
///
/// - With `check_auto_pid`, a controller running its own PID table gets no
///   explicit PID.
/// - If the heater is not already in auto on this sensor, the controller is
///   put in manual, switched to the sensor and given the binding's heater
///   voltage ceiling. Auto mode is restored after the new setpoint.
/// - With `heater_on` false the heater is left in manual at zero output and
///   zero setpoint. `force_pid` writes the PID for `setpoint` before that,
///   so the table PID is already loaded when the heater is next switched to
///   auto; the output and setpoint are zeroed regardless.
pub(crate) async fn apply_setpoint_and_pid(
    devices: &mut Devices,
    binding: &SensorBinding,
    setpoint: f64,
    heater_on: bool,
    check_auto_pid: bool,
    force_pid: bool,
) -> CryoResult<()> {
    let mut lookup = binding.pid_for(setpoint);
    let itc = controller(devices, binding)?;
    if check_auto_pid && itc.auto_pid() {
        lookup.found = false;
    }

    let (auto_heater, _) = itc.auto_status();
    let channel_changed = !(auto_heater && itc.heater_sensor() == binding.sensor);
    if channel_changed {
        itc.set_auto_status(false, false).await?;
        itc.set_heater_sensor(binding.sensor).await?;
        if let Some(limit) = binding.heater_limit {
            itc.set_maximum_heater_voltage(limit).await?;
        }
    }
    debug!(
        sensor = binding.sensor,
        setpoint, heater_on, channel_changed, pid = ?lookup, "Applying setpoint"
    );

    if heater_on {
        itc.set_temperature(setpoint).await?;
        if lookup.found {
            itc.set_pid(lookup.pid).await?;
        }
        if channel_changed {
            itc.set_auto_status(true, false).await?;
        }
    } else {
        if force_pid && lookup.found {
            itc.set_pid(lookup.pid).await?;
        }
        itc.set_auto_status(false, false).await?;
        itc.set_heater_output(0.0).await?;
        itc.set_temperature(0.0).await?;
    }
    Ok(())
}

/// Manual mode, zero setpoint, zero output. The active sensor is left alone.
pub(crate) async fn zero_heater(devices: &mut Devices, binding: &SensorBinding) -> CryoResult<()> {
    let itc = controller(devices, binding)?;
    itc.set_auto_status(false, false).await?;
    itc.set_temperature(0.0).await?;
    itc.set_heater_output(0.0).await
}

/// Switches a binding's heater to its `setpoint_on` or off.
pub(crate) async fn toggle_heater(devices: &mut Devices, binding: &SensorBinding, on: bool) -> CryoResult<()> {
    let setpoint = binding.setpoint_on.ok_or_else(|| {
        CryoError::Configuration(format!(
            "controller {} sensor {} has no setpoint_on",
            binding.controller, binding.sensor
        ))
    })?;
    apply_setpoint_and_pid(devices, binding, setpoint, on, false, false).await
}

/// Puts a binding's heater in manual at zero output.
pub(crate) async fn heater_off(devices: &mut Devices, binding: &SensorBinding) -> CryoResult<()> {
    apply_setpoint_and_pid(devices, binding, 0.0, false, false, false).await
}

impl VectorMagnet {
    /// Reads one node.
    pub async fn temperature(&self, node: ThermalNode) -> CryoResult<f64> {
        let mut devices = self.cluster.acquire().await;
        read_node(&mut devices, &self.config.sensors, node).await
    }

    /// Range-selected He3 pot temperature.
    pub async fn he3_temperature(&self) -> CryoResult<f64> {
        self.temperature(ThermalNode::He3Pot).await
    }

    /// Reads every node under one lock.
    pub async fn temperatures(&self) -> CryoResult<Temperatures> {
        let sensors = &self.config.sensors;
        let mut devices = self.cluster.acquire().await;
        Ok(Temperatures {
            int_plate: read_binding(&mut devices, &sensors.int_plate).await?,
            magnet: read_binding(&mut devices, &sensors.magnet).await?,
            he3_sorb: read_binding(&mut devices, &sensors.he3_sorb).await?,
            pt2_plate: read_binding(&mut devices, &sensors.pt2_plate).await?,
            pt1_plate: read_binding(&mut devices, &sensors.pt1_plate).await?,
            heat_switch: read_binding(&mut devices, &sensors.heat_switch).await?,
            he3_pot: read_he3(&mut devices, sensors).await?,
        })
    }

    /// Setpoint and PID of whichever He3 pot sensor drives its heater in
    /// auto mode, low range first. Zeros when neither does.
    pub async fn he3_setpoint_and_pid(&self) -> CryoResult<(f64, Pid)> {
        let sensors = &self.config.sensors;
        let mut devices = self.cluster.acquire().await;
        for binding in [&sensors.he3_pot_low, &sensors.he3_pot_high] {
            let itc = controller(&mut devices, binding)?;
            if itc.auto_status().0 && itc.heater_sensor() == binding.sensor {
                let setpoint = itc.get_setpoint().await?;
                let pid = itc.get_pid().await?;
                return Ok((setpoint, pid));
            }
        }
        Ok((0.0, Pid::new(0.0, 0.0, 0.0)))
    }

    /// Regulates a node at `setpoint`, taking the PID from its table unless
    /// the controller runs auto-PID.
    #[instrument(skip(self), fields(node = %node), err)]
    pub async fn set_node_setpoint(&self, node: ThermalNode, setpoint: f64) -> CryoResult<()> {
        let binding = node.heater_binding(&self.config.sensors)?;
        let mut devices = self.cluster.acquire().await;
        apply_setpoint_and_pid(&mut devices, binding, setpoint, true, true, false).await
    }

    /// Switches a node's heater to its configured `setpoint_on`, or off.
    #[instrument(skip(self), fields(node = %node), err)]
    pub async fn toggle_heater(&self, node: ThermalNode, on: bool) -> CryoResult<()> {
        let binding = node.heater_binding(&self.config.sensors)?;
        let mut devices = self.cluster.acquire().await;
        toggle_heater(&mut devices, binding, on).await
    }

    /// Turns a node's heater off.
    #[instrument(skip(self), fields(node = %node), err)]
    pub async fn heater_off(&self, node: ThermalNode) -> CryoResult<()> {
        let binding = node.heater_binding(&self.config.sensors)?;
        let mut devices = self.cluster.acquire().await;
        heater_off(&mut devices, binding).await
    }

    /// Opens valve V1.
    pub async fn open_valve(&self) -> CryoResult<()> {
        self.cluster.acquire().await.valve.open_valve().await
    }

    /// Closes valve V1.
    pub async fn close_valve(&self) -> CryoResult<()> {
        self.cluster.acquire().await.valve.close_valve().await
    }
}

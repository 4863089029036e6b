//! He3 insert procedures.
//!
//! Each procedure is a sequence of device batches and guarded waits. A batch
//! takes the cluster lock for its commands only; waits poll a temperature,
//! sleeping with the lock released, until a condition holds or a detector's
//! own deadline passes.
//!
//! Waits that end on a deadline do not stop the procedure. They are recorded
//! in the returned [`ProcedureReport`]; callers that need the target reached
//! use [`ProcedureReport::require_settled`].
//!
//! | Procedure | Sequence |
//! |-----------|----------|
//! | [`cooldown`](VectorMagnet::cooldown) | heaters off, PT2 precool, heat switch until the sorb is cold, sorb to condense setpoint, cooling onset, pot below 5 K |
//! | [`precondense`](VectorMagnet::precondense) | V1 open with the heat switch on until the sorb is cold |
//! | [`condense`](VectorMagnet::condense) | warm the sorb, wait for the pot to settle, dump through V1 |
//! | [`recondense`](VectorMagnet::recondense) | precondense then condense |
//! | [`run_to_temperature`](VectorMagnet::run_to_temperature) | configure heaters, wait for stability |

use std::time::Duration;

use cryo_core::error::{CryoError, CryoResult};
use cryo_core::stability::{
    CoolingOnset, StabilityDetector, StabilitySetpoint, StabilityTimer, StabilityTrend,
};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use super::thermal::{
    apply_setpoint_and_pid, heater_off, read_binding, read_he3, read_node, toggle_heater, zero_heater,
};
use super::{CoordinatorState, ThermalNode, VectorMagnet};
use crate::config::seconds;

const FAST_POLL: Duration = Duration::from_millis(500);
const SLOW_POLL: Duration = Duration::from_secs(1);
const SORB_SWEEP_STEP: Duration = Duration::from_millis(250);

/// Regression window (samples) of the cooldown and condense trend waits.
const TREND_WINDOW: usize = 120;
/// Regression window (samples) of the run-to-temperature waits.
const RUN_WINDOW: usize = 180;

/// Pot slope (K/s) below which cooling counts as started.
const ONSET_SLOPE: f64 = -1e-5;
const ONSET_DWELL: Duration = Duration::from_secs(120);
const ONSET_TIMEOUT: Duration = Duration::from_secs(1800);
/// Pot temperature that ends a cooldown.
const POT_COLD: f64 = 5.0;

const PRECONDENSE_SETTLE: Duration = Duration::from_secs(600);
const CONDENSE_SETTLE: Duration = Duration::from_secs(1200);
const CONDENSE_WARM_MIN: Duration = Duration::from_secs(180);
const CONDENSE_STABLE_MIN: Duration = Duration::from_secs(600);
const SORB_OFF_SETTLE: Duration = Duration::from_secs(60);

/// Targets below this run with the heaters off and a trend wait.
const BASE_TEMPERATURE: f64 = 1e-5;
const BASE_TREND_TOLERANCE: f64 = 0.005;
const BASE_TIMEOUT: Duration = Duration::from_secs(115_200);
const SETPOINT_TIMEOUT: Duration = Duration::from_secs(7200);

/// A guarded wait that ended on its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOutWait {
    /// What was being waited for
    pub wait: &'static str,
    /// How long it ran
    pub elapsed: Duration,
}

/// Outcome of a procedure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct ProcedureReport {
    timed_out: Vec<TimedOutWait>,
}

impl ProcedureReport {
    fn record(&mut self, wait: &'static str, elapsed: Duration) {
        warn!(wait, ?elapsed, "Wait timed out, continuing");
        self.timed_out.push(TimedOutWait { wait, elapsed });
    }

    /// Appends another procedure's timeouts.
    pub fn merge(&mut self, other: ProcedureReport) {
        self.timed_out.extend(other.timed_out);
    }

    /// Waits that ended on their deadline, in order.
    pub fn timed_out(&self) -> &[TimedOutWait] {
        &self.timed_out
    }

    /// Whether every wait ended on its condition.
    pub fn is_settled(&self) -> bool {
        self.timed_out.is_empty()
    }

    /// Escalates the first timeout to an error.
    pub fn require_settled(self) -> CryoResult<Self> {
        match self.timed_out.first() {
            None => Ok(self),
            Some(first) => Err(CryoError::TimeoutExceeded {
                operation: first.wait.to_string(),
                elapsed: first.elapsed,
            }),
        }
    }
}

/// How the deviation of [`VectorMagnet::wait_for_stable_temperature`] is
/// given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationMode {
    /// Kelvin
    #[default]
    Absolute,
    /// Percent of the target
    Percent,
}

impl DeviationMode {
    fn band(self, target: f64, deviation: f64) -> f64 {
        match self {
            DeviationMode::Absolute => deviation.abs(),
            DeviationMode::Percent => (target * deviation / 100.0).abs(),
        }
    }
}

/// Setpoint `elapsed` seconds into a sorb sweep.
fn sweep_setpoint(start: f64, end: f64, rate_per_min: f64, elapsed: f64) -> f64 {
    let travelled = rate_per_min.abs() / 60.0 * elapsed;
    if end >= start {
        (start + travelled).min(end)
    } else {
        (start - travelled).max(end)
    }
}

impl VectorMagnet {
    /// Polls `node` until `done` holds for a reading.
    async fn wait_until(
        &self,
        wait: &'static str,
        node: ThermalNode,
        poll: Duration,
        done: impl Fn(f64) -> bool,
    ) -> CryoResult<f64> {
        let started = Instant::now();
        loop {
            let value = {
                let mut devices = self.cluster.acquire().await;
                read_node(&mut devices, &self.config.sensors, node).await?
            };
            if done(value) {
                debug!(wait, %node, value, elapsed = ?started.elapsed(), "Wait finished");
                return Ok(value);
            }
            sleep(poll).await;
        }
    }

    /// Cools the insert from warm to a condensed-ready state.
    #[instrument(skip(self), err)]
    pub async fn cooldown(&self) -> CryoResult<ProcedureReport> {
        let _state = self.enter(CoordinatorState::Cooldown);
        let sensors = &self.config.sensors;
        let control = &self.config.control.cooldown;
        let mut report = ProcedureReport::default();

        {
            let mut devices = self.cluster.acquire().await;
            for binding in [
                &sensors.he3_sorb,
                &sensors.he3_pot_high,
                &sensors.he3_pot_low,
                &sensors.pt1_plate,
                &sensors.heat_switch,
            ] {
                zero_heater(&mut devices, binding).await?;
            }
            toggle_heater(&mut devices, &sensors.pt2_plate, true).await?;
            devices.valve.open_valve().await?;
        }
        info!(threshold = control.precool_final_he3_temp, "Precooling");
        let precool = control.precool_final_he3_temp;
        self.wait_until("precool", ThermalNode::He3PotHigh, FAST_POLL, |t| t < precool)
            .await?;

        {
            let mut devices = self.cluster.acquire().await;
            toggle_heater(&mut devices, &sensors.pt2_plate, false).await?;
            toggle_heater(&mut devices, &sensors.heat_switch, true).await?;
            devices.valve.open_valve().await?;
        }
        info!("Cooling sorb through the heat switch");
        let mut trend = StabilityTrend::new(TREND_WINDOW, control.he3_stability_initial, None);
        loop {
            let (he3, sorb) = {
                let mut devices = self.cluster.acquire().await;
                let he3 = read_he3(&mut devices, sensors).await?;
                (he3, read_binding(&mut devices, &sensors.he3_sorb).await?)
            };
            if trend.is_finished() && sorb < control.sorb_target {
                break;
            }
            trend.add_point(he3);
            sleep(FAST_POLL).await;
        }

        {
            let mut devices = self.cluster.acquire().await;
            devices.valve.close_valve().await?;
            toggle_heater(&mut devices, &sensors.heat_switch, false).await?;
        }
        let off_temp = sensors.heat_switch.off_temp.unwrap_or(f64::INFINITY);
        self.wait_until("heat switch off", ThermalNode::HeatSwitch, FAST_POLL, |t| t < off_temp)
            .await?;

        {
            let mut devices = self.cluster.acquire().await;
            let setpoint = self.config.control.condense.sorb_setpoint;
            apply_setpoint_and_pid(&mut devices, &sensors.he3_sorb, setpoint, true, true, false).await?;
        }
        info!("Waiting for the pot to start cooling");
        let started = Instant::now();
        let mut onset = CoolingOnset::new(ONSET_SLOPE, ONSET_DWELL, Some(ONSET_TIMEOUT));
        loop {
            let he3 = self.he3_temperature().await?;
            onset.add_point(he3);
            if onset.is_finished() {
                break;
            }
            sleep(SLOW_POLL).await;
        }
        if onset.is_timed_out() {
            report.record("cooling onset", started.elapsed());
        }

        self.wait_until("pot cold", ThermalNode::He3Pot, FAST_POLL, |t| t < POT_COLD)
            .await?;
        info!("Cooldown finished");
        Ok(report)
    }

    /// Pumps on the sorb with V1 open until it is cold.
    #[instrument(skip(self), err)]
    pub async fn precondense(&self) -> CryoResult<ProcedureReport> {
        let _state = self.enter(CoordinatorState::Precondense);
        let sensors = &self.config.sensors;
        let control = &self.config.control.precondense;

        {
            let mut devices = self.cluster.acquire().await;
            devices.valve.open_valve().await?;
            heater_off(&mut devices, &sensors.he3_sorb).await?;
            toggle_heater(&mut devices, &sensors.heat_switch, true).await?;
        }
        sleep(PRECONDENSE_SETTLE).await;
        let target = control.sorb_target;
        self.wait_until("sorb cold", ThermalNode::He3Sorb, FAST_POLL, |t| t <= target)
            .await?;
        sleep(seconds(control.delay_secs)).await;
        self.close_valve().await?;
        info!("Precondense finished");
        Ok(ProcedureReport::default())
    }

    /// Condenses He3 into the pot.
    #[instrument(skip(self), err)]
    pub async fn condense(&self) -> CryoResult<ProcedureReport> {
        let _state = self.enter(CoordinatorState::Condense);
        let sensors = &self.config.sensors;
        let control = &self.config.control.condense;

        {
            let mut devices = self.cluster.acquire().await;
            devices.valve.close_valve().await?;
            toggle_heater(&mut devices, &sensors.heat_switch, false).await?;
            heater_off(&mut devices, &sensors.he3_sorb).await?;
        }
        let off_temp = sensors.heat_switch.off_temp.unwrap_or(f64::INFINITY);
        self.wait_until("heat switch off", ThermalNode::HeatSwitch, FAST_POLL, |t| t < off_temp)
            .await?;

        self.set_node_setpoint(ThermalNode::He3Sorb, control.sorb_sweep_start).await?;
        sleep(CONDENSE_SETTLE).await;
        let sorb = self.temperature(ThermalNode::He3Sorb).await?;
        self.sweep_sorb(sorb, control.sorb_sweep_end).await?;
        self.set_node_setpoint(ThermalNode::He3Sorb, control.sorb_setpoint).await?;
        sleep(CONDENSE_SETTLE).await;

        info!("Waiting for the pot to stop warming");
        let started = Instant::now();
        let mut trend = StabilityTrend::new(TREND_WINDOW, 0.0, None);
        loop {
            trend.add_point(self.he3_temperature().await?);
            if started.elapsed() >= CONDENSE_WARM_MIN && trend.is_buffer_full() && trend.trend() <= 0.0 {
                break;
            }
            sleep(SLOW_POLL).await;
        }

        info!("Waiting for the pot to settle");
        let started = Instant::now();
        let mut trend = StabilityTrend::new(TREND_WINDOW, control.he3_stability, None);
        loop {
            trend.add_point(self.he3_temperature().await?);
            let slope = trend.trend();
            if started.elapsed() >= CONDENSE_STABLE_MIN
                && slope <= 0.0
                && (slope * 60.0).abs() < control.he3_stability.abs()
                && trend.is_stable()
            {
                break;
            }
            sleep(SLOW_POLL).await;
        }

        sleep(seconds(control.delay_secs)).await;
        self.heater_off(ThermalNode::He3Sorb).await?;
        sleep(SORB_OFF_SETTLE).await;
        self.open_valve().await?;
        sleep(seconds(control.v1_open_time_secs)).await;
        {
            let mut devices = self.cluster.acquire().await;
            devices.valve.close_valve().await?;
            toggle_heater(&mut devices, &sensors.heat_switch, true).await?;
        }
        info!("Condense finished");
        Ok(ProcedureReport::default())
    }

    /// Precondense followed by condense.
    #[instrument(skip(self), err)]
    pub async fn recondense(&self) -> CryoResult<ProcedureReport> {
        let _state = self.enter(CoordinatorState::Recondense);
        let mut report = self.precondense().await?;
        report.merge(self.condense().await?);
        Ok(report)
    }

    /// Ramps the sorb setpoint from `start` (its measured temperature) to
    /// `end` at its configured sweep rate, in either direction, or steps
    /// straight to `end` without one.
    async fn sweep_sorb(&self, start: f64, end: f64) -> CryoResult<()> {
        let rate = match self.config.sensors.he3_sorb.sweep_rate {
            Some(rate) if end != start => rate,
            _ => return self.set_node_setpoint(ThermalNode::He3Sorb, end).await,
        };
        debug!(start, end, rate, "Sweeping sorb");
        let started = Instant::now();
        loop {
            let setpoint = sweep_setpoint(start, end, rate, started.elapsed().as_secs_f64());
            self.set_node_setpoint(ThermalNode::He3Sorb, setpoint).await?;
            if setpoint == end {
                return Ok(());
            }
            sleep(SORB_SWEEP_STEP).await;
        }
    }

    /// Configures the heat switch, valve and pot heater for `target`.
    ///
    /// Below the recondense cutoff the pot regulates on the low-range sensor
    /// with V1 closed and the heat switch either held at its low setpoint or
    /// on. Above it the pot uses the high-range sensor and the heat switch
    /// is off. A target of zero leaves the pot heater off.
    #[instrument(skip(self), err)]
    pub async fn set_temp(&self, target: f64) -> CryoResult<()> {
        let sensors = &self.config.sensors;
        let control = &self.config.control.temperature;
        let low_range = control.he3_upper_temp > target;

        let mut devices = self.cluster.acquire().await;
        if low_range {
            devices.valve.close_valve().await?;
        }
        if low_range && control.he3_low_lim_low_hs_tset < target {
            apply_setpoint_and_pid(&mut devices, &sensors.heat_switch, control.low_hs_tset, true, true, false)
                .await?;
        } else {
            toggle_heater(&mut devices, &sensors.heat_switch, low_range).await?;
        }
        let pot = if low_range { &sensors.he3_pot_low } else { &sensors.he3_pot_high };
        apply_setpoint_and_pid(&mut devices, pot, target, target >= 1e-6, true, true).await
    }

    /// Sets up `target` and waits for the pot to stabilize there.
    #[instrument(skip(self), err)]
    pub async fn run_to_temperature(&self, target: f64) -> CryoResult<ProcedureReport> {
        let _state = self.enter(CoordinatorState::RunToTemperature);
        let control = &self.config.control.temperature;
        let mut report = ProcedureReport::default();
        self.set_temp(target).await?;

        let mut detector: Box<dyn StabilityDetector> = if target < BASE_TEMPERATURE {
            Box::new(StabilityTrend::new(RUN_WINDOW, BASE_TREND_TOLERANCE, Some(BASE_TIMEOUT)))
        } else {
            let tolerance = control.stability_table.allowed_deviation(target);
            Box::new(StabilitySetpoint::new(RUN_WINDOW, target, tolerance, Some(SETPOINT_TIMEOUT)))
        };
        let started = Instant::now();
        loop {
            detector.add_point(self.he3_temperature().await?);
            if detector.is_finished() {
                break;
            }
            sleep(SLOW_POLL).await;
        }
        if detector.is_timed_out() {
            report.record("temperature stability", started.elapsed());
        }

        sleep(seconds(control.delay_before_stable_secs)).await;
        info!(setpoint = target, settled = report.is_settled(), "Run to temperature finished");
        Ok(report)
    }

    /// Brings the pot to `target`, cooling down or recondensing first when
    /// the present state cannot reach it.
    #[instrument(skip(self), err)]
    pub async fn set_temperature(&self, target: f64) -> CryoResult<ProcedureReport> {
        let control = &self.config.control.temperature;
        let current = self.he3_temperature().await?;
        let mut report = ProcedureReport::default();

        if target < current - control.cooldown_delta {
            info!(current, setpoint = target, "Target needs a cooldown");
            report.merge(self.cooldown().await?);
        }
        if target < current && current > control.he3_upper_temp && target < control.he3_upper_temp {
            info!(current, setpoint = target, "Target needs a recondense");
            report.merge(self.recondense().await?);
        }
        report.merge(self.run_to_temperature(target).await?);
        Ok(report)
    }

    /// Waits until the pot has stayed within `target ± deviation` for
    /// `stabilized_time`, or `timeout` passes.
    #[instrument(skip(self), err)]
    pub async fn wait_for_stable_temperature(
        &self,
        target: f64,
        deviation: f64,
        mode: DeviationMode,
        stabilized_time: Duration,
        timeout: Duration,
    ) -> CryoResult<ProcedureReport> {
        let band = mode.band(target, deviation);
        let mut timer = StabilityTimer::new(stabilized_time, 2.0 * band, Some(timeout));
        let mut report = ProcedureReport::default();
        let started = Instant::now();
        loop {
            let value = self.he3_temperature().await?;
            timer.add_point(value);
            if timer.is_finished() && (value - target).abs() <= band {
                break;
            }
            if timer.is_timed_out() {
                report.record("stable temperature", started.elapsed());
                break;
            }
            sleep(SLOW_POLL).await;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_report_escalates_first_timeout() {
        let mut report = ProcedureReport::default();
        assert!(report.is_settled());
        report.record("cooling onset", Duration::from_secs(1800));
        let mut other = ProcedureReport::default();
        other.record("temperature stability", Duration::from_secs(7200));
        report.merge(other);

        assert_eq!(report.timed_out().len(), 2);
        assert!(logs_contain("Wait timed out, continuing"));
        match report.require_settled() {
            Err(CryoError::TimeoutExceeded { operation, elapsed }) => {
                assert_eq!(operation, "cooling onset");
                assert_eq!(elapsed, Duration::from_secs(1800));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(ProcedureReport::default().require_settled().is_ok());
    }

    #[test]
    fn test_sweep_setpoint_clamps_in_both_directions() {
        assert_eq!(sweep_setpoint(20.0, 28.0, 2.0, 0.0), 20.0);
        assert!((sweep_setpoint(20.0, 28.0, 2.0, 60.0) - 22.0).abs() < 1e-12);
        assert_eq!(sweep_setpoint(20.0, 28.0, 2.0, 600.0), 28.0);
        assert!((sweep_setpoint(28.0, 20.0, -2.0, 30.0) - 27.0).abs() < 1e-12);
        assert_eq!(sweep_setpoint(28.0, 20.0, 2.0, 1e6), 20.0);
    }

    #[test]
    fn test_deviation_band() {
        assert_eq!(DeviationMode::Absolute.band(4.0, -0.01), 0.01);
        assert!((DeviationMode::Percent.band(4.0, 2.5) - 0.1).abs() < 1e-12);
    }
}

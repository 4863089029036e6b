//! Vector field control.
//!
//! The current field and the setpoint are each a [`FieldState`]: Cartesian
//! or spherical, never both. A setter switches both to the representation
//! it works in before touching a component, so the tracker always holds one
//! authoritative representation and converts only on request.

use std::time::Duration;

use cryo_core::coordinates::{
    cartesian_to_spherical, clean, equal_enough, spherical_to_cartesian, DEFAULT_TOLERANCE,
};
use cryo_core::error::{CryoError, CryoResult};
use cryo_hardware::drivers::Activity;
use tracing::{debug, info, instrument};

use super::cluster::Devices;
use super::{ReadMode, VectorMagnet};

/// Component tolerance (tesla or degrees) for "at setpoint".
pub const FIELD_TOLERANCE: f64 = 1e-5;

/// Poll period of [`VectorMagnet::wait_for_field`].
pub const FIELD_POLL_PERIOD: Duration = Duration::from_millis(200);

/// A field vector tagged with its representation.
///
/// Spherical components are `[magnitude, azimuthal, polar]` in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldState {
    /// `[x, y, z]` in tesla
    Cartesian([f64; 3]),
    /// `[magnitude, azimuthal, polar]`
    Spherical([f64; 3]),
}

impl Default for FieldState {
    fn default() -> Self {
        FieldState::Cartesian([0.0; 3])
    }
}

impl FieldState {
    /// Components in this state's own representation.
    pub fn components(&self) -> [f64; 3] {
        match *self {
            FieldState::Cartesian(v) | FieldState::Spherical(v) => v,
        }
    }

    /// Whether Cartesian is authoritative.
    pub fn is_cartesian(&self) -> bool {
        matches!(self, FieldState::Cartesian(_))
    }

    /// The same vector as Cartesian components.
    pub fn cartesian(&self) -> [f64; 3] {
        match *self {
            FieldState::Cartesian(v) => v,
            FieldState::Spherical(v) => spherical_to_cartesian(v),
        }
    }

    /// The same vector as spherical components.
    pub fn spherical(&self, negate: bool) -> [f64; 3] {
        match *self {
            FieldState::Cartesian(v) => cartesian_to_spherical(v, negate, DEFAULT_TOLERANCE),
            FieldState::Spherical(v) => v,
        }
    }

    /// Converts to Cartesian. A no-op when already Cartesian.
    pub fn to_cartesian(self) -> Self {
        FieldState::Cartesian(self.cartesian())
    }

    /// Converts to spherical. A no-op when already spherical.
    pub fn to_spherical(self, negate: bool) -> Self {
        FieldState::Spherical(self.spherical(negate))
    }

    fn with_component(self, index: usize, value: f64) -> Self {
        let mut v = self.components();
        v[index] = value;
        match self {
            FieldState::Cartesian(_) => FieldState::Cartesian(v),
            FieldState::Spherical(_) => FieldState::Spherical(v),
        }
    }
}

/// Current field and setpoint, kept in the same representation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FieldTracker {
    /// Last field read from the supplies
    pub current: FieldState,
    /// Last requested target
    pub setpoint: FieldState,
    /// `[x, y, z]` targets as the supplies hold them, after rounding to each
    /// supply's field resolution. `None` until the supplies are commanded or
    /// read back.
    pub commanded: Option<[f64; 3]>,
}

impl FieldTracker {
    /// Makes Cartesian authoritative for both vectors.
    pub fn use_cartesian(&mut self) {
        self.current = self.current.to_cartesian();
        self.setpoint = self.setpoint.to_cartesian();
    }

    /// Makes spherical authoritative for both vectors.
    pub fn use_spherical(&mut self) {
        self.current = self.current.to_spherical(false);
        self.setpoint = self.setpoint.to_spherical(false);
    }

    /// Whether readings should be expressed with a negative magnitude to
    /// match the setpoint.
    pub fn negate(&self) -> bool {
        self.setpoint.components()[0] < 0.0
    }

    /// Stores a Cartesian reading in the active representation.
    pub fn record_reading(&mut self, cartesian: [f64; 3]) {
        self.current = if self.setpoint.is_cartesian() {
            FieldState::Cartesian(cartesian)
        } else {
            FieldState::Spherical(cartesian_to_spherical(cartesian, self.negate(), DEFAULT_TOLERANCE))
        };
    }

    /// Whether every Cartesian axis is within [`FIELD_TOLERANCE`] of its
    /// target.
    ///
    /// The comparison is always Cartesian: a spherical setpoint has many
    /// equivalent forms (negative magnitude, wrapped angles, arbitrary
    /// angles at zero magnitude) and only the axis values are unique. The
    /// targets are the commanded ones when known, since a supply stops at
    /// its own resolution rather than at the requested value.
    pub fn at_setpoint(&self) -> bool {
        let target = self.commanded.unwrap_or_else(|| self.setpoint.cartesian());
        equal_enough(self.current.cartesian(), target, FIELD_TOLERANCE)
    }
}

/// Per-axis sweep rates (T/min) that bring every axis from `from` to `to` at
/// the same moment.
///
/// The axis needing the most time at `proportion * limit` fixes the sweep
/// duration and sweeps at exactly that rate; the others are slowed to match.
/// Returns `None` when no axis moves.
pub fn ramp_rates(from: [f64; 3], to: [f64; 3], limits: [f64; 3], proportion: f64) -> Option<[f64; 3]> {
    let deltas = [0, 1, 2].map(|i| (to[i] - from[i]).abs());
    let minutes = (0..3)
        .map(|i| deltas[i] / (proportion * limits[i]))
        .fold(0.0_f64, f64::max);
    if minutes <= 0.0 {
        return None;
    }
    Some(deltas.map(|d| d / minutes))
}

/// Sends the tracked setpoint to the supplies, axis 0 first.
///
/// A moving axis gets its sweep rate before its target. An axis that does
/// not move keeps its rate but is still sent its target and `A1`; a supply
/// left in hold resumes.
async fn command_setpoint(devices: &mut Devices, limits: [f64; 3], proportion: f64) -> CryoResult<()> {
    let from = clean(devices.field.current.cartesian());
    let to = clean(devices.field.setpoint.cartesian());
    let rates = ramp_rates(from, to, limits, proportion);
    debug!(?from, ?to, ?rates, "Commanding field");

    let mut commanded = [0.0; 3];
    for (axis, supply) in devices.supplies.iter_mut().enumerate() {
        if let Some(rate) = rates.map(|r| r[axis]).filter(|r| *r > 0.0) {
            supply.set_sweep_rate(rate).await?;
        }
        supply.set_field(to[axis]).await?;
        commanded[axis] = supply.model().quantize_field(to[axis]);
    }
    devices.field.commanded = Some(commanded);
    Ok(())
}

/// Reads the field and the supplies' targets into a Cartesian tracker.
pub(super) async fn sync_field(devices: &mut Devices) -> CryoResult<()> {
    let mut setpoint = [0.0; 3];
    for (axis, supply) in devices.supplies.iter_mut().enumerate() {
        setpoint[axis] = supply.get_field_setpoint().await?;
    }
    devices.field.use_cartesian();
    devices.field.setpoint = FieldState::Cartesian(setpoint);
    devices.field.commanded = Some(setpoint);
    read_cartesian(devices).await?;
    Ok(())
}

async fn read_cartesian(devices: &mut Devices) -> CryoResult<[f64; 3]> {
    let mut field = [0.0; 3];
    for (axis, supply) in devices.supplies.iter_mut().enumerate() {
        field[axis] = supply.get_field().await?;
    }
    devices.field.record_reading(field);
    Ok(field)
}

fn check_axis(axis: usize) -> CryoResult<()> {
    if axis < 3 {
        Ok(())
    } else {
        Err(CryoError::InvalidParameter(format!("field axis must be 0, 1 or 2 (got {})", axis)))
    }
}

impl VectorMagnet {
    async fn apply_setpoint(&self, update: impl FnOnce(&mut FieldTracker)) -> CryoResult<()> {
        let limits = self.config.magnet.ramp_limits;
        let proportion = self.ramp_proportion();
        let mut devices = self.cluster.acquire().await;
        update(&mut devices.field);
        command_setpoint(&mut devices, limits, proportion).await
    }

    /// Sets one Cartesian component and re-sweeps all three axes.
    #[instrument(skip(self), err)]
    pub async fn set_field_axis(&self, axis: usize, tesla: f64) -> CryoResult<()> {
        check_axis(axis)?;
        self.apply_setpoint(|field| {
            field.use_cartesian();
            field.setpoint = field.setpoint.with_component(axis, tesla);
        })
        .await
    }

    /// Sets the x component.
    pub async fn set_field_x(&self, tesla: f64) -> CryoResult<()> {
        self.set_field_axis(0, tesla).await
    }

    /// Sets the y component.
    pub async fn set_field_y(&self, tesla: f64) -> CryoResult<()> {
        self.set_field_axis(1, tesla).await
    }

    /// Sets the z component.
    pub async fn set_field_z(&self, tesla: f64) -> CryoResult<()> {
        self.set_field_axis(2, tesla).await
    }

    /// Sets the whole field as `[x, y, z]`.
    #[instrument(skip(self), err)]
    pub async fn set_field_cartesian(&self, field: [f64; 3]) -> CryoResult<()> {
        self.apply_setpoint(|tracker| {
            tracker.use_cartesian();
            tracker.setpoint = FieldState::Cartesian(field);
        })
        .await
    }

    /// Sets the whole field as `[magnitude, azimuthal, polar]`.
    #[instrument(skip(self), err)]
    pub async fn set_field_spherical(&self, field: [f64; 3]) -> CryoResult<()> {
        self.apply_setpoint(|tracker| {
            tracker.use_spherical();
            tracker.setpoint = FieldState::Spherical(field);
        })
        .await
    }

    async fn set_spherical_component(&self, index: usize, value: f64) -> CryoResult<()> {
        self.apply_setpoint(|field| {
            field.use_spherical();
            field.setpoint = field.setpoint.with_component(index, value);
        })
        .await
    }

    /// Sets the magnitude, keeping both angles.
    pub async fn set_field_magnitude(&self, tesla: f64) -> CryoResult<()> {
        self.set_spherical_component(0, tesla).await
    }

    /// Sets the angle from +z (degrees).
    pub async fn set_field_azimuthal(&self, degrees: f64) -> CryoResult<()> {
        self.set_spherical_component(1, degrees).await
    }

    /// Sets the angle in the xy plane from +x (degrees).
    pub async fn set_field_polar(&self, degrees: f64) -> CryoResult<()> {
        self.set_spherical_component(2, degrees).await
    }

    /// Field as `[x, y, z]`, read from the supplies or from the last reading
    /// depending on the read mode.
    pub async fn get_field_cartesian(&self) -> CryoResult<[f64; 3]> {
        let mut devices = self.cluster.acquire().await;
        match self.read_mode() {
            ReadMode::Direct => read_cartesian(&mut devices).await,
            ReadMode::Cached => Ok(devices.field.current.cartesian()),
        }
    }

    /// Field as `[magnitude, azimuthal, polar]`.
    ///
    /// The magnitude is negative when the setpoint's is.
    pub async fn get_field_spherical(&self) -> CryoResult<[f64; 3]> {
        let mut devices = self.cluster.acquire().await;
        if self.read_mode() == ReadMode::Direct {
            read_cartesian(&mut devices).await?;
        }
        let negate = devices.field.negate();
        Ok(devices.field.current.spherical(negate))
    }

    /// Field targets as `[x, y, z]`.
    pub async fn get_field_setpoints(&self) -> CryoResult<[f64; 3]> {
        let mut devices = self.cluster.acquire().await;
        match self.read_mode() {
            ReadMode::Direct => {
                let mut setpoints = [0.0; 3];
                for (axis, supply) in devices.supplies.iter_mut().enumerate() {
                    setpoints[axis] = supply.get_field_setpoint().await?;
                }
                Ok(setpoints)
            }
            ReadMode::Cached => Ok(devices.field.setpoint.cartesian()),
        }
    }

    /// Sweep rates (T/min). In cached mode these are the configured ceilings
    /// scaled by the ramp proportion.
    pub async fn get_field_ramp_rates(&self) -> CryoResult<[f64; 3]> {
        match self.read_mode() {
            ReadMode::Direct => {
                let mut devices = self.cluster.acquire().await;
                let mut rates = [0.0; 3];
                for (axis, supply) in devices.supplies.iter_mut().enumerate() {
                    rates[axis] = supply.get_sweep_rate().await?;
                }
                Ok(rates)
            }
            ReadMode::Cached => {
                let proportion = self.ramp_proportion();
                Ok(self.config.magnet.ramp_limits.map(|l| l * proportion))
            }
        }
    }

    /// Reads the field and compares it to the setpoint.
    pub async fn is_field_at_setpoint(&self) -> CryoResult<bool> {
        let mut devices = self.cluster.acquire().await;
        read_cartesian(&mut devices).await?;
        Ok(devices.field.at_setpoint())
    }

    /// Polls until the field reaches its setpoint.
    ///
    /// While the pause flag is set the supplies are held and the wait
    /// blocks until resumed. There is no deadline: a ramp that never
    /// arrives keeps this waiting.
    #[instrument(skip(self), err)]
    pub async fn wait_for_field(&self) -> CryoResult<()> {
        let pause = self.pause_handle();
        loop {
            if self.is_field_at_setpoint().await? {
                info!("Field at setpoint");
                return Ok(());
            }
            tokio::time::sleep(FIELD_POLL_PERIOD).await;
            if pause.is_paused() {
                info!("Field sweep paused");
                self.hold_field().await?;
                pause.wait_resumed().await;
                self.resume_field().await?;
                info!("Field sweep resumed");
            }
        }
    }

    /// Holds every supply at its present output (`A0`).
    pub async fn hold_field(&self) -> CryoResult<()> {
        let mut devices = self.cluster.acquire().await;
        for supply in devices.supplies.iter_mut() {
            supply.set_activity(Activity::Hold).await?;
        }
        Ok(())
    }

    /// Restarts every supply towards its target (`A1`).
    pub async fn resume_field(&self) -> CryoResult<()> {
        let mut devices = self.cluster.acquire().await;
        for supply in devices.supplies.iter_mut() {
            supply.set_activity(Activity::ToSetpoint).await?;
        }
        Ok(())
    }
}

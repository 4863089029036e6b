//! Field/thermal coordinator.
//!
//! [`VectorMagnet`] owns the device cluster (three magnet supplies, three
//! ITC503 controllers and valve V1) and runs everything that spans more
//! than one instrument: synchronized vector-field sweeps, heater/PID
//! selection for the He3 insert, and the cooldown and condensation
//! procedures.
//!
//! All methods take `&self`; share the coordinator as `Arc<VectorMagnet>`
//! between the foreground caller and the [monitor](crate::monitor). Device
//! I/O is serialized through the single cluster lock, which is never held
//! across a poll sleep.
//!
//! # Example
//! ```no_run
//! use cryomag::{config::CryomagConfig, coordinator::VectorMagnet};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let magnet = VectorMagnet::new(CryomagConfig::load()?)?;
//! magnet.initialize().await?;
//! magnet.set_field_cartesian([0.1, 0.0, 0.0]).await?;
//! magnet.wait_for_field().await?;
//! let report = magnet.set_temperature(0.3).await?;
//! report.require_settled()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use cryo_core::error::{CryoError, CryoResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::config::CryomagConfig;

pub mod cluster;
pub mod field;
pub mod procedures;
pub mod thermal;

pub use cluster::{ClusterGuard, DeviceCluster, Devices};
pub use field::{ramp_rates, FieldState, FieldTracker, FIELD_TOLERANCE};
pub use procedures::{DeviationMode, ProcedureReport, TimedOutWait};
pub use thermal::{Temperatures, ThermalNode};

/// Where field getters take their values from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Query the supplies on every call.
    #[default]
    Direct,
    /// Answer from the last reading and the commanded setpoint.
    Cached,
}

/// Procedure currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// No procedure running
    #[default]
    Idle,
    /// Precooling the insert and waiting for the pot to start cooling
    Cooldown,
    /// Pumping on the sorb with V1 open
    Precondense,
    /// Condensing He3 into the pot
    Condense,
    /// Precondense followed by condense
    Recondense,
    /// Regulating at a target temperature
    RunToTemperature,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorState::Idle => "idle",
            CoordinatorState::Cooldown => "cooldown",
            CoordinatorState::Precondense => "precondense",
            CoordinatorState::Condense => "condense",
            CoordinatorState::Recondense => "recondense",
            CoordinatorState::RunToTemperature => "run to temperature",
        };
        f.write_str(name)
    }
}

/// Cooperative pause flag for [`VectorMagnet::wait_for_field`].
///
/// Pausing does not interrupt a command in flight. The field wait notices
/// the flag on its next poll, holds the supplies, and blocks until resumed.
#[derive(Debug, Clone)]
pub struct PauseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests a pause.
    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    /// Lifts the pause.
    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    /// Whether a pause is requested.
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns once the flag is clear.
    pub async fn wait_resumed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

/// Restores the previous [`CoordinatorState`] when dropped.
pub(crate) struct StateScope<'a> {
    tx: &'a watch::Sender<CoordinatorState>,
    previous: CoordinatorState,
}

impl Drop for StateScope<'_> {
    fn drop(&mut self) {
        self.tx.send_replace(self.previous);
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldSettings {
    ramp_proportion: f64,
    read_mode: ReadMode,
}

/// Coordinator for the vector magnet and the He3 insert.
pub struct VectorMagnet {
    config: CryomagConfig,
    cluster: DeviceCluster,
    settings: RwLock<FieldSettings>,
    pause: PauseHandle,
    state: watch::Sender<CoordinatorState>,
}

impl VectorMagnet {
    /// Validates `config` and builds the drivers it describes. No port is
    /// opened until [`initialize`](Self::initialize).
    pub fn new(config: CryomagConfig) -> CryoResult<Self> {
        config.validate()?;
        let cluster = DeviceCluster::from_config(&config)?;
        Self::with_cluster(config, cluster)
    }

    /// Coordinator over pre-built drivers.
    pub fn with_cluster(config: CryomagConfig, cluster: DeviceCluster) -> CryoResult<Self> {
        config.validate()?;
        let settings = FieldSettings {
            ramp_proportion: config.magnet.ramp_proportion,
            read_mode: config.magnet.read_mode,
        };
        let (state, _rx) = watch::channel(CoordinatorState::Idle);
        Ok(Self {
            config,
            cluster,
            settings: RwLock::new(settings),
            pause: PauseHandle::new(),
            state,
        })
    }

    /// Resolved configuration.
    pub fn config(&self) -> &CryomagConfig {
        &self.config
    }

    /// Runs every device's bring-up sequence, then reads the field and the
    /// supplies' targets.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> CryoResult<()> {
        let mut devices = self.cluster.acquire().await;
        devices.initialize().await?;
        field::sync_field(&mut devices).await?;
        info!(field = ?devices.field.current, "Vector magnet initialized");
        Ok(())
    }

    /// Closes every link.
    #[instrument(skip(self), err)]
    pub async fn finalize(&self) -> CryoResult<()> {
        self.cluster.acquire().await.close().await
    }

    /// Batch access to the device cluster.
    pub async fn devices(&self) -> ClusterGuard<'_> {
        self.cluster.acquire().await
    }

    /// Fraction of the configured ramp limits used for sweeps.
    pub fn ramp_proportion(&self) -> f64 {
        self.settings.read().ramp_proportion
    }

    /// Sets the ramp proportion, `0 < p <= 1`.
    pub fn set_ramp_proportion(&self, proportion: f64) -> CryoResult<()> {
        if !(proportion > 0.0 && proportion <= 1.0) {
            return Err(CryoError::InvalidParameter(format!(
                "ramp proportion must be in (0, 1] (got {})",
                proportion
            )));
        }
        self.settings.write().ramp_proportion = proportion;
        Ok(())
    }

    /// Current read mode.
    pub fn read_mode(&self) -> ReadMode {
        self.settings.read().read_mode
    }

    /// Switches between direct and cached reads.
    pub fn set_read_mode(&self, mode: ReadMode) {
        self.settings.write().read_mode = mode;
    }

    /// Handle for pausing field sweeps from another task.
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    /// Procedure currently running.
    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub(crate) fn enter(&self, state: CoordinatorState) -> StateScope<'_> {
        let previous = self.state.send_replace(state);
        info!(%state, %previous, "Entering procedure");
        StateScope {
            tx: &self.state,
            previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_mode_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: ReadMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"cached\"").unwrap();
        assert_eq!(parsed.mode, ReadMode::Cached);
        assert_eq!(ReadMode::default(), ReadMode::Direct);
    }

    #[tokio::test]
    async fn test_pause_handle_round_trip() {
        let handle = PauseHandle::new();
        assert!(!handle.is_paused());
        handle.pause();
        assert!(handle.clone().is_paused());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_resumed().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        handle.resume();
        waiter.await.unwrap();
        assert!(!handle.is_paused());
    }
}

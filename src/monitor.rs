//! Background status monitor.
//!
//! A tokio task polls the coordinator at a fixed period and publishes each
//! [`StatusSnapshot`] on a bounded broadcast channel. Subscribers that fall
//! behind lose the oldest snapshots (`RecvError::Lagged`); the monitor
//! never waits for them.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use cryomag::{config::CryomagConfig, coordinator::VectorMagnet, monitor};
//! # async fn run(magnet: Arc<VectorMagnet>, config: CryomagConfig) {
//! let handle = monitor::spawn_monitor(magnet, &config.monitor);
//! let mut rx = handle.subscribe();
//! while let Ok(snapshot) = rx.recv().await {
//!     println!("{:?} K", snapshot.temperatures.he3_pot);
//! }
//! handle.stop().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cryo_core::error::CryoResult;
use cryo_core::tables::Pid;
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::coordinator::{CoordinatorState, Temperatures, VectorMagnet};

/// One poll of the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Poll counter, starting at 0
    pub sequence: u64,
    /// Wall-clock time of the poll
    pub taken_at: SystemTime,
    /// Field `[x, y, z]` (T)
    pub field: [f64; 3],
    /// Field targets `[x, y, z]` (T)
    pub setpoints: [f64; 3],
    /// Sweep rates (T/min)
    pub ramp_rates: [f64; 3],
    /// Fraction of the ramp limits in use
    pub ramp_proportion: f64,
    /// Every thermal node
    pub temperatures: Temperatures,
    /// He3 pot setpoint, zero when no pot heater is in auto
    pub he3_setpoint: f64,
    /// He3 pot PID
    pub he3_pid: Pid,
    /// Procedure running at the time of the poll
    pub state: CoordinatorState,
}

/// Reads one snapshot.
pub async fn snapshot(magnet: &VectorMagnet, sequence: u64) -> CryoResult<StatusSnapshot> {
    let field = magnet.get_field_cartesian().await?;
    let setpoints = magnet.get_field_setpoints().await?;
    let ramp_rates = magnet.get_field_ramp_rates().await?;
    let temperatures = magnet.temperatures().await?;
    let (he3_setpoint, he3_pid) = magnet.he3_setpoint_and_pid().await?;
    Ok(StatusSnapshot {
        sequence,
        taken_at: SystemTime::now(),
        field,
        setpoints,
        ramp_rates,
        ramp_proportion: magnet.ramp_proportion(),
        temperatures,
        he3_setpoint,
        he3_pid,
        state: magnet.state(),
    })
}

/// Running monitor task.
pub struct MonitorHandle {
    tx: broadcast::Sender<StatusSnapshot>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// New receiver for snapshots published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    /// Stops polling and waits for the task to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Starts polling `magnet` every `config.period()`.
pub fn spawn_monitor(magnet: Arc<VectorMagnet>, config: &MonitorConfig) -> MonitorHandle {
    let (tx, _) = broadcast::channel(config.capacity.max(1));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(poll_loop(magnet, tx.clone(), config.period(), shutdown_rx));
    MonitorHandle {
        tx,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    }
}

async fn poll_loop(
    magnet: Arc<VectorMagnet>,
    tx: broadcast::Sender<StatusSnapshot>,
    period: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut sequence = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(period) => {
                match snapshot(&magnet, sequence).await {
                    Ok(snapshot) => {
                        sequence += 1;
                        // No subscribers is not an error.
                        let _ = tx.send(snapshot);
                    }
                    Err(e) => warn!(error = %e, kind = ?e.kind(), "Monitor poll failed"),
                }
            }
        }
    }
    debug!(polls = sequence, "Monitor stopped");
}

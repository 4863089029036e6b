//! The device cluster: three supplies, three controllers and the valve
//! behind one lock.
//!
//! Axis writes are meant to look simultaneous to the hardware, so there is
//! no per-device locking. Every batch of device I/O takes the whole cluster
//! through [`DeviceCluster::acquire`] and releases it before sleeping.

use cryo_core::error::{CryoError, CryoResult};
use cryo_hardware::drivers::{
    Ips120, Itc503, MagnetSupply, OxfordInstrument, OxfordValve, Ps120, SupplyModel,
};
use tokio::sync::{Mutex, MutexGuard};

use super::field::FieldTracker;
use crate::config::CryomagConfig;

/// Everything guarded by the cluster lock.
pub struct Devices {
    /// x, y and z supplies
    pub supplies: [Box<dyn MagnetSupply>; 3],
    /// Temperature controllers, indexed by sensor bindings
    pub controllers: [Itc503; 3],
    /// Valve V1
    pub valve: OxfordValve,
    pub(crate) field: FieldTracker,
}

/// Exclusive access to the cluster for one batch of operations.
pub type ClusterGuard<'a> = MutexGuard<'a, Devices>;

/// Owning handle over the device cluster.
pub struct DeviceCluster {
    devices: Mutex<Devices>,
}

impl DeviceCluster {
    /// Wraps pre-built drivers.
    pub fn new(
        supplies: [Box<dyn MagnetSupply>; 3],
        controllers: [Itc503; 3],
        valve: OxfordValve,
    ) -> Self {
        Self {
            devices: Mutex::new(Devices {
                supplies,
                controllers,
                valve,
                field: FieldTracker::default(),
            }),
        }
    }

    /// Builds drivers for the configured addresses. Nothing is opened.
    pub fn from_config(config: &CryomagConfig) -> CryoResult<Self> {
        let delay = config.magnet.switch_heater_delay();
        let supplies: Vec<Box<dyn MagnetSupply>> = config
            .magnet
            .supplies
            .iter()
            .map(|supply| -> Box<dyn MagnetSupply> {
                match supply.model {
                    SupplyModel::Ips120 => Box::new(
                        Ips120::new(supply.name.clone(), supply.address.clone())
                            .with_switch_heater_delay(delay),
                    ),
                    SupplyModel::Ps120 => Box::new(
                        Ps120::new(supply.name.clone(), supply.address.clone())
                            .with_switch_heater_delay(delay),
                    ),
                }
            })
            .collect();
        let supplies: [Box<dyn MagnetSupply>; 3] = supplies.try_into().map_err(|v: Vec<_>| {
            CryoError::Configuration(format!("expected 3 magnet supplies, found {}", v.len()))
        })?;

        let controllers: Vec<Itc503> = config
            .controllers
            .iter()
            .map(|c| Itc503::new(c.name.clone(), c.address.clone()))
            .collect();
        let controllers: [Itc503; 3] = controllers.try_into().map_err(|v: Vec<_>| {
            CryoError::Configuration(format!("expected 3 temperature controllers, found {}", v.len()))
        })?;

        let valve = OxfordValve::new(
            config.valve.name.clone(),
            config.valve.address.clone(),
            config.valve.channel,
            config.valve.normally_closed,
        )?;

        Ok(Self::new(supplies, controllers, valve))
    }

    /// Takes the cluster lock.
    pub async fn acquire(&self) -> ClusterGuard<'_> {
        self.devices.lock().await
    }
}

impl Devices {
    /// Brings up supplies, then controllers, then the valve, each in index
    /// order.
    pub async fn initialize(&mut self) -> CryoResult<()> {
        for supply in self.supplies.iter_mut() {
            supply.initialize().await?;
        }
        for controller in self.controllers.iter_mut() {
            controller.initialize().await?;
        }
        self.valve.initialize().await
    }

    /// Closes every link in the same order, reporting the first failure.
    pub async fn close(&mut self) -> CryoResult<()> {
        let mut first_error = None;
        for supply in self.supplies.iter_mut() {
            if let Err(e) = supply.close().await {
                tracing::warn!(device = %supply.name(), error = %e, "Failed to close supply");
                first_error.get_or_insert(e);
            }
        }
        for controller in self.controllers.iter_mut() {
            if let Err(e) = controller.close().await {
                tracing::warn!(device = %controller.name(), error = %e, "Failed to close controller");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.valve.close().await {
            tracing::warn!(device = %self.valve.name(), error = %e, "Failed to close valve");
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }
}

//! # cryomag
//!
//! Control of a three-axis vector magnet and He3 insert built from Oxford
//! Instruments hardware: IPS120/PS120 magnet supplies, ITC503 temperature
//! controllers and a gas-handling valve, all on one ISOBUS line.
//!
//! ## Crate Structure
//!
//! - **`config`**: `CryomagConfig`, loaded from TOML plus `CRYOMAG_*`
//!   environment overrides and validated before any port is opened.
//! - **`logging`**: `tracing` subscriber setup (pretty, compact or JSON).
//! - **`coordinator`**: `VectorMagnet`, which owns the device cluster,
//!   sweeps the field on all three axes together, selects heaters and PIDs,
//!   and runs the cooldown/condense procedures.
//! - **`monitor`**: background polling task publishing status snapshots.
//!
//! Protocol transport and device drivers live in `cryo-hardware`; errors,
//! coordinate conversion, stability detectors and lookup tables in
//! `cryo-core`.

pub mod config;
pub mod coordinator;
pub mod logging;
pub mod monitor;

pub use config::CryomagConfig;
pub use coordinator::{CoordinatorState, ProcedureReport, ThermalNode, VectorMagnet};
pub use cryo_core::error::{CryoError, CryoResult};
pub use monitor::{spawn_monitor, MonitorHandle, StatusSnapshot};

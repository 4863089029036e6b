//! Core types for cryomag.
//!
//! Everything here is free of device I/O except the port abstraction in
//! [`serial`]:
//!
//! - [`error`]: `CryoError` taxonomy shared by every crate
//! - [`coordinates`]: spherical/Cartesian field vector conversion
//! - [`stability`]: streaming regression and stability detectors
//! - [`tables`]: PID and stability tables with saturating lookup
//! - [`serial`]: async instrument ports and line settings

pub mod coordinates;
pub mod error;
pub mod serial;
pub mod stability;
pub mod tables;

pub use error::{CryoError, CryoResult};

//! # cryo-hardware
//!
//! Oxford Instruments protocol transport and device drivers.
//!
//! - **[`transport`]** - ISOBUS/GPIB framing, echo verification, residual
//!   flushing and turnaround delays
//! - **[`shared_ports`]** - one open port per physical line
//! - **[`drivers`]** - ITC503, IPS120, PS120 and valve drivers
//! - **`sim`** - in-process instrument simulator (feature `simulator`)
//!
//! ## Feature Flags
//!
//! - `serial` - real serial ports via tokio-serial (default)
//! - `simulator` - simulated ISOBUS line for tests and dry runs

pub mod drivers;
pub mod shared_ports;
pub mod transport;

#[cfg(any(test, feature = "simulator"))]
pub mod sim;

pub use drivers::{
    DeviceStatus, Ips120, Itc503, MagnetSupply, OxfordInstrument, OxfordValve, Ps120,
};
pub use transport::{DeviceAddress, OxfordTransport, Protocol, Transport};

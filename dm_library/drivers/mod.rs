//! Bus drivers for the DM toolkit
//!
//! # Architecture
//!
//! ```text
//! discovery / watchdog / choreography / controllers
//!   │
//!   └── BusManager (buffered receive, listeners, filters, periodic sends)
//!           │
//!           └── CanDriver
//!               ├── SimulationCanDriver (always available)
//!               └── SocketCanDriver (feature `can-hardware`)
//! ```

pub mod bus;

pub use bus::{
    BusManager, CanDriver, CanDriverBackend, CanFrame, Listener, ListenerId, PeriodicHandle,
    PeriodicTaskStatus, SimulatedMotor, SimulationCanDriver,
};

#[cfg(feature = "can-hardware")]
pub use bus::SocketCanDriver;

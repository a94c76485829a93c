//! CAN bus drivers
//!
//! # Available Drivers
//!
//! - `SimulationCanDriver` - Always available, simulates a CAN bus with motors attached
//! - `SocketCanDriver` - Linux SocketCAN interface (requires `can-hardware` feature)
//!
//! Drivers only move frames. Buffered receive, listener fan-out, software
//! filtering and periodic scheduling live in [`BusManager`].

mod manager;
mod periodic;
mod simulation;

#[cfg(feature = "can-hardware")]
mod socketcan;

pub use manager::{BusManager, Listener, ListenerId};
pub use periodic::{PeriodicHandle, PeriodicTaskStatus};
pub use simulation::{SimulatedMotor, SimulationCanDriver};

#[cfg(feature = "can-hardware")]
pub use self::socketcan::SocketCanDriver;

use std::time::Duration;

use dm_core::driver::{BackendKind, DriverStatus};
use dm_core::error::{DmError, DmResult};

use crate::protocol::FilterRule;

/// CAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN ID (11 or 29 bit)
    pub id: u32,
    /// Extended frame flag
    pub extended: bool,
    /// Remote transmission request
    pub rtr: bool,
    /// Data (0-8 bytes)
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Standard data frame
    pub fn new(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            extended: false,
            rtr: false,
            data: data.to_vec(),
        }
    }
}

/// CAN driver backend selection
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum CanDriverBackend {
    #[default]
    Simulation,
    #[cfg(feature = "can-hardware")]
    SocketCan,
}

impl CanDriverBackend {
    /// Map a configured backend onto the compiled-in drivers
    pub fn from_kind(kind: BackendKind) -> DmResult<Self> {
        match kind {
            BackendKind::Simulation => Ok(Self::Simulation),
            #[cfg(feature = "can-hardware")]
            BackendKind::SocketCan => Ok(Self::SocketCan),
            #[cfg(not(feature = "can-hardware"))]
            BackendKind::SocketCan => Err(DmError::FeatureNotAvailable(
                "SocketCAN support requires the `can-hardware` feature".to_string(),
            )),
        }
    }
}

/// Type-erased CAN driver
///
/// All methods take `&self`; the reader thread and senders share one driver.
pub enum CanDriver {
    Simulation(SimulationCanDriver),
    #[cfg(feature = "can-hardware")]
    SocketCan(SocketCanDriver),
}

impl CanDriver {
    pub fn new(backend: CanDriverBackend, channel: &str) -> DmResult<Self> {
        match backend {
            CanDriverBackend::Simulation => Ok(Self::Simulation(SimulationCanDriver::new())),
            #[cfg(feature = "can-hardware")]
            CanDriverBackend::SocketCan => Ok(Self::SocketCan(SocketCanDriver::new(channel)?)),
        }
        .map_err(|e: DmError| {
            log::error!("Failed to create CAN driver for {}: {}", channel, e);
            e
        })
    }

    pub fn simulation() -> Self {
        Self::Simulation(SimulationCanDriver::new())
    }

    /// Access the simulated bus, if that is the active backend
    pub fn as_simulation(&self) -> Option<&SimulationCanDriver> {
        match self {
            Self::Simulation(d) => Some(d),
            #[cfg(feature = "can-hardware")]
            _ => None,
        }
    }

    // ========================================================================
    // Lifecycle methods
    // ========================================================================

    pub fn open(&self) -> DmResult<()> {
        match self {
            Self::Simulation(d) => d.open(),
            #[cfg(feature = "can-hardware")]
            Self::SocketCan(d) => d.open(),
        }
    }

    pub fn close(&self) -> DmResult<()> {
        match self {
            Self::Simulation(d) => d.close(),
            #[cfg(feature = "can-hardware")]
            Self::SocketCan(d) => d.close(),
        }
    }

    pub fn status(&self) -> DriverStatus {
        match self {
            Self::Simulation(d) => d.status(),
            #[cfg(feature = "can-hardware")]
            Self::SocketCan(d) => d.status(),
        }
    }

    /// Whether the backend can run periodic transmit tasks
    pub fn supports_periodic(&self) -> bool {
        match self {
            Self::Simulation(d) => d.supports_periodic(),
            #[cfg(feature = "can-hardware")]
            Self::SocketCan(_) => true,
        }
    }

    // ========================================================================
    // Bus methods
    // ========================================================================

    pub fn write_frame(&self, frame: &CanFrame) -> DmResult<()> {
        match self {
            Self::Simulation(d) => d.write_frame(frame),
            #[cfg(feature = "can-hardware")]
            Self::SocketCan(d) => d.write_frame(frame),
        }
    }

    /// Wait up to `timeout` for one frame; `Ok(None)` when nothing arrived
    pub fn read_frame(&self, timeout: Duration) -> DmResult<Option<CanFrame>> {
        match self {
            Self::Simulation(d) => d.read_frame(timeout),
            #[cfg(feature = "can-hardware")]
            Self::SocketCan(d) => d.read_frame(timeout),
        }
    }

    pub fn set_filters(&self, filters: &[FilterRule]) -> DmResult<()> {
        match self {
            Self::Simulation(d) => d.set_filters(filters),
            #[cfg(feature = "can-hardware")]
            Self::SocketCan(d) => d.set_filters(filters),
        }
    }
}

//! # DM Library
//!
//! Fleet control for Damiao DM-J series servo controllers on a shared CAN bus.
//!
//! ## Structure
//!
//! ```text
//! dm_library/
//! ── protocol/      # Pure wire codec (commands, feedback, MIT packing, management)
//! ── drivers/       # CAN backends and the BusManager
//! ── telemetry/     # Feedback ingest, liveness and telemetry stores, CSV logging
//! ── discovery/     # Passive sniff and active probe
//! ── watchdog/      # Stale-telemetry safety disables
//! ── choreography/  # Sine-wave group motion
//! ── controllers/   # One-shot commands and parameter access
//! ── bus_stats/     # Interface statistics from `ip`
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use dm_library::{controllers, discovery, BusManager, Choreographer, Waveform};
//!
//! let bus = Arc::new(BusManager::simulation("vcan0"));
//! bus.open()?;
//! let motors = discovery::active_probe(&bus, &[1, 2, 3], Duration::from_millis(100))?;
//! controllers::enable_all(&bus, &[1, 2, 3])?;
//!
//! let choreographer = Choreographer::new(Arc::clone(&bus));
//! choreographer.start(&[1, 2, 3], 2.0, 0.5, Waveform::Sine)?;
//! ```

pub mod bus_stats;
pub mod choreography;
pub mod controllers;
pub mod discovery;
pub mod drivers;
pub mod protocol;
pub mod telemetry;
pub mod watchdog;

pub use bus_stats::{BusStatistics, BusStatsService};
pub use choreography::{Choreographer, RunPath, Waveform};
pub use discovery::{DiscoveryService, SweepGuard, SweepKind};
pub use drivers::{BusManager, CanDriver, CanFrame, PeriodicHandle, SimulationCanDriver};
pub use telemetry::{
    LivenessTable, MotorLiveness, TelemetryIngest, TelemetrySample, TelemetrySink, TelemetryStore,
};
pub use watchdog::{Watchdog, WatchdogEvent, WatchdogRunner, WatchdogState};

#[cfg(feature = "can-hardware")]
pub use drivers::SocketCanDriver;

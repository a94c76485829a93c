//! # DM Core
//!
//! Shared building blocks for the DM servo toolkit:
//!
//! - **Errors**: [`DmError`] and the [`DmResult`] alias used across the workspace
//! - **Drivers**: lifecycle status reported by bus backends
//! - **Config**: persisted buses, motors and watchdog timing

pub mod config;
pub mod driver;
pub mod error;

pub use config::{AppConfig, BusConfig, MotorRecord, ScaleLimits, WatchdogConfig};
pub use driver::{BackendKind, DriverStatus};
pub use error::{DmError, DmResult};

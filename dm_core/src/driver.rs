//! Driver utilities for the DM toolkit
//!
//! Bus backends are standalone structs with direct methods; this module only
//! holds the lifecycle status they all report.

use serde::{Deserialize, Serialize};

/// Driver status for lifecycle tracking
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DriverStatus {
    /// Driver has not been initialized yet
    #[default]
    Uninitialized,
    /// Driver is ready to operate
    Ready,
    /// Driver is actively running/streaming
    Running,
    /// Driver encountered an error
    Error(String),
    /// Driver has been shut down
    Shutdown,
}

impl DriverStatus {
    /// Whether frames may be exchanged in this state
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::Error(msg) => write!(f, "Error: {}", msg),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Bus backend identifier as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Linux SocketCAN interface
    #[default]
    SocketCan,
    /// In-process simulated bus
    Simulation,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SocketCan => write!(f, "socketcan"),
            Self::Simulation => write!(f, "simulation"),
        }
    }
}

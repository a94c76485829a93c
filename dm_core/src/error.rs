//! Unified error handling for the DM toolkit
//!
//! Every crate in the workspace returns [`DmResult`]. The variants follow the
//! failure taxonomy of the motor stack: frames that cannot be decoded, bus
//! transport failures (with timeouts as a transport sub-case), invalid
//! arguments and configuration problems.

use thiserror::Error;

/// Main error type for DM operations
#[derive(Debug, Error)]
pub enum DmError {
    /// I/O related errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame payload has the wrong length or an unrepresentable field
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Bus open/send/periodic/filter failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// A deadline elapsed without a matching response
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Parse errors
    #[error("Parse error: {0}")]
    ParseError(String),

    /// External command execution errors
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// Feature not available errors
    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),

    /// Generic internal errors (use sparingly)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Catch-all for other error types
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using DmError
pub type DmResult<T> = Result<T, DmError>;

impl From<serde_yaml::Error> for DmError {
    fn from(err: serde_yaml::Error) -> Self {
        DmError::Serialization(format!("YAML error: {}", err))
    }
}

impl From<toml::de::Error> for DmError {
    fn from(err: toml::de::Error) -> Self {
        DmError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for DmError {
    fn from(err: toml::ser::Error) -> Self {
        DmError::Serialization(format!("TOML serialization error: {}", err))
    }
}

impl From<std::num::ParseIntError> for DmError {
    fn from(err: std::num::ParseIntError) -> Self {
        DmError::ParseError(format!("Integer parse error: {}", err))
    }
}

impl From<std::num::ParseFloatError> for DmError {
    fn from(err: std::num::ParseFloatError) -> Self {
        DmError::ParseError(format!("Float parse error: {}", err))
    }
}

impl From<&str> for DmError {
    fn from(msg: &str) -> Self {
        DmError::Other(msg.to_string())
    }
}

impl From<String> for DmError {
    fn from(msg: String) -> Self {
        DmError::Other(msg)
    }
}

// Helper methods
impl DmError {
    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        DmError::Transport(msg.into())
    }

    /// Create a malformed frame error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        DmError::MalformedFrame(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        DmError::Timeout(msg.into())
    }

    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DmError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        DmError::InvalidInput(msg.into())
    }

    /// Transport failures, including timeouts waiting on the bus
    pub fn is_transport(&self) -> bool {
        matches!(self, DmError::Transport(_) | DmError::Timeout(_))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, DmError::Timeout(_))
    }

    /// Check if this is a malformed frame error
    pub fn is_malformed(&self) -> bool {
        matches!(self, DmError::MalformedFrame(_))
    }
}

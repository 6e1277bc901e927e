//! Custom error types for the rig controller.
//!
//! `RigError` is the single error type surfaced to callers of the controller
//! (and, through the HTTP layer, to dashboards). It follows the propagation
//! policy of the controller:
//!
//! - **Caller mistakes** (`PortUnavailable`, `PortNotSelected`, `PortNotOpen`,
//!   `InvalidLimitKind`, `InvalidTransition`) are returned as typed failures so the
//!   control plane can tell the user what to fix.
//! - **I/O failures** (`Io`, `Serial`, `Storage`, `Json`) wrap the underlying error
//!   when they originate from a direct caller action (opening a port, creating a
//!   data folder, writing a command).
//! - **Background failures** never become a `RigError` at all: malformed telemetry is
//!   reported as [`crate::telemetry::MalformedLine`] and dropped, and teardown errors
//!   are logged and swallowed.

use crate::session::SessionPhase;
use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

/// Errors returned by controller operations.
#[derive(Error, Debug)]
pub enum RigError {
    /// The named serial device is not among the currently enumerated ports.
    #[error("Serial port '{0}' is not available")]
    PortUnavailable(String),

    /// `open()` was called before a port was selected with `set_port()`.
    #[error("No serial port selected")]
    PortNotSelected,

    /// A write or command was attempted while the link is closed.
    #[error("Serial port is not open")]
    PortNotOpen,

    /// The limit kind is not `Time`, `Infusion` or `Both`.
    #[error("Invalid limit type '{0}'. Must be one of: Time, Infusion, Both")]
    InvalidLimitKind(String),

    /// The requested session operation is not valid in the current phase.
    #[error("Cannot {operation} while session is {phase}")]
    InvalidTransition {
        /// What was attempted
        operation: &'static str,
        /// Phase at the time
        phase: SessionPhase,
    },

    /// Port, socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Port enumeration or opening failed.
    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    /// Writing an event log failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A JSON document could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The loaded configuration is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl RigError {
    /// Whether the error was caused by the caller rather than the rig or host.
    ///
    /// The HTTP layer maps these to `400 Bad Request`.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            RigError::PortUnavailable(_)
                | RigError::PortNotSelected
                | RigError::PortNotOpen
                | RigError::InvalidLimitKind(_)
        )
    }
}

impl From<csv::Error> for RigError {
    fn from(err: csv::Error) -> Self {
        RigError::Storage(err.to_string())
    }
}

//! Custom error types for the sweep system.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failure classes that can occur while driving a source-measure unit and a DAQ
//! chassis.
//!
//! ## Error Hierarchy
//!
//! Errors fall into two groups, and [`DaqError::is_fatal`] tells them apart:
//!
//! - **Fatal, pre-run**: `Configuration`, `Config`, `DeviceNotFound`, `OperatorAbort`,
//!   `InvalidTransition`. These abort before any channel is energized.
//! - **Per-step, recoverable**: `NoMeasurement`, `Hardware`, `ModeMismatch`,
//!   `OutOfBounds`, `InvalidChannel`. These are logged and degrade data completeness
//!   but never unwind an in-progress sweep.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling with the `?` operator.

use std::fmt;
use thiserror::Error;

use crate::hardware::DriveMode;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// A bus or transaction failure reported by the driver layer.
///
/// The device answered with an error (or did not answer at all) while a
/// command was in flight. The commanded state of the device is uncertain.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Hardware fault on '{device}': {message}")]
pub struct HardwareFault {
    /// Physical device or line identifier, passed through unmodified.
    pub device: String,
    /// Driver supplied description of the failure.
    pub message: String,
}

impl HardwareFault {
    /// Create a new fault for the given device.
    pub fn new(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// The quantity an out-of-mode command tried to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Electrical current (A)
    Current,
    /// Electrical voltage (V)
    Voltage,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Current => write!(f, "current"),
            Quantity::Voltage => write!(f, "voltage"),
        }
    }
}

/// Primary error type for the sweep system.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A setting is missing or has a value that is logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The addressed hardware is absent or could not be connected to.
    #[error("{device} was not found or could not be connected to")]
    DeviceNotFound {
        /// Device identifier or module name that was looked up
        device: String,
    },

    /// The device answered without fault but returned no data.
    #[error("The {device} could not make a measurement")]
    NoMeasurement {
        /// Device or physical line that was sampled
        device: String,
    },

    /// Bus or transaction failure.
    #[error(transparent)]
    Hardware(#[from] HardwareFault),

    /// An actuation of the wrong quantity was requested and ignored.
    #[error("SMU {device} is {mode}; {attempted} sourcing is not allowed")]
    ModeMismatch {
        /// SMU device identifier
        device: String,
        /// Drive mode the SMU is bound to
        mode: DriveMode,
        /// Quantity the caller tried to drive
        attempted: Quantity,
    },

    /// A channel was used against its role or does not exist.
    #[error("Invalid channel usage on {channel}: {reason}")]
    InvalidChannel {
        /// Channel identifier or physical line
        channel: String,
        /// What was wrong with the request
        reason: String,
    },

    /// A setpoint fell outside the permitted range of the device.
    #[error("Setpoint {value} outside [{min}, {max}] on {device}")]
    OutOfBounds {
        /// Device or physical line
        device: String,
        /// Requested setpoint
        value: f64,
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },

    /// The operator declined to continue at the confirmation gate.
    #[error("Operator aborted before output was enabled")]
    OperatorAbort,

    /// The sweep was interrupted by the operator.
    #[error("Sweep interrupted after {completed} steps")]
    Interrupted {
        /// Number of steps recorded before the interrupt was honored
        completed: usize,
    },

    /// The controller state machine was asked for an illegal transition.
    #[error("Invalid controller transition {from} -> {to}")]
    InvalidTransition {
        /// State the controller was in
        from: String,
        /// Requested target state
        to: String,
    },

    /// One or more devices failed to reach their safe idle state.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),

    /// I/O error from the sink or a transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Functionality that was not included at compile time.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether this error must abort the run rather than be recorded as a gap.
    pub fn is_fatal(&self) -> bool {
        match self {
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::DeviceNotFound { .. }
            | DaqError::OperatorAbort
            | DaqError::InvalidTransition { .. }
            | DaqError::FeatureNotEnabled(_) => true,
            DaqError::NoMeasurement { .. }
            | DaqError::Hardware(_)
            | DaqError::ModeMismatch { .. }
            | DaqError::InvalidChannel { .. }
            | DaqError::OutOfBounds { .. } => false,
            DaqError::Interrupted { .. }
            | DaqError::ShutdownFailed(_)
            | DaqError::Io(_)
            | DaqError::Csv(_) => true,
        }
    }

    /// Short label used in gap records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) => "configuration",
            DaqError::DeviceNotFound { .. } => "device_not_found",
            DaqError::NoMeasurement { .. } => "no_measurement",
            DaqError::Hardware(_) => "hardware_fault",
            DaqError::ModeMismatch { .. } => "mode_mismatch",
            DaqError::InvalidChannel { .. } => "invalid_channel",
            DaqError::OutOfBounds { .. } => "out_of_bounds",
            DaqError::OperatorAbort => "operator_abort",
            DaqError::Interrupted { .. } => "interrupted",
            DaqError::InvalidTransition { .. } => "invalid_transition",
            DaqError::ShutdownFailed(_) => "shutdown_failed",
            DaqError::Io(_) => "io",
            DaqError::Csv(_) => "csv",
            DaqError::FeatureNotEnabled(_) => "feature_not_enabled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_errors_are_not_fatal() {
        let no_data = DaqError::NoMeasurement {
            device: "SMU".into(),
        };
        assert!(!no_data.is_fatal());
        assert_eq!(no_data.kind(), "no_measurement");

        let fault: DaqError = HardwareFault::new("cDAQ1Mod1/ao0", "timeout").into();
        assert!(!fault.is_fatal());
        assert!(fault.to_string().contains("cDAQ1Mod1/ao0"));
    }

    #[test]
    fn construction_errors_are_fatal() {
        assert!(DaqError::Configuration("bad".into()).is_fatal());
        assert!(DaqError::DeviceNotFound {
            device: "GPIB0::15::INSTR".into()
        }
        .is_fatal());
        assert!(DaqError::OperatorAbort.is_fatal());
    }

    #[test]
    fn mode_mismatch_message_names_quantity() {
        let err = DaqError::ModeMismatch {
            device: "GPIB0::15::INSTR".into(),
            mode: DriveMode::CurrentDriven,
            attempted: Quantity::Voltage,
        };
        let msg = err.to_string();
        assert!(msg.contains("voltage sourcing"));
        assert!(msg.contains("current driven"));
    }
}

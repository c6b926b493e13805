//! Hardware seams and device roles.
//!
//! Devices are driven through two small, blocking driver traits:
//!
//! - [`SmuDriver`]: one source-measure unit, SCPI-level operations
//! - [`AnalogBus`]: a DAQ chassis bus carrying named modules with analog
//!   output (`ao`) and analog input (`ai`) lines
//!
//! On top of them sit the device roles with the safety logic:
//! [`DeviceChannel`], [`SourceMeasureUnit`] and [`DaqChassis`].
//!
//! # Contract
//!
//! - Every call blocks until the hardware transaction completes or faults.
//!   There is no software timeout beyond the one used at connection time.
//! - A driver error is a [`HardwareFault`]: the device state is uncertain.
//! - A read that succeeds with no data is reported as `Ok(None)` / an empty
//!   vector, which the device roles turn into `NoMeasurement`.
//! - Device ids and module names are opaque and passed through unmodified.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult, HardwareFault};

pub mod channel;
pub mod chassis;
pub mod mock;
pub mod scpi;
pub mod smu;

pub use channel::{ChannelRole, DeviceChannel};
pub use chassis::{ChannelReadings, DaqChassis};
pub use smu::{Actuation, SourceMeasureUnit};

/// Numeric identifier of a chassis line (`ao<N>` / `ai<N>`).
pub type ChannelId = u32;

/// Result type for driver level calls.
pub type BusResult<T> = std::result::Result<T, HardwareFault>;

/// Quantity an SMU is permanently configured to actuate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveMode {
    /// Sources current, measures voltage, voltage is compliance limited
    CurrentDriven,
    /// Sources voltage, measures current, current is compliance limited
    VoltageDriven,
}

impl FromStr for DriveMode {
    type Err = DaqError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CURRENT_DRIVEN" => Ok(DriveMode::CurrentDriven),
            "VOLTAGE_DRIVEN" => Ok(DriveMode::VoltageDriven),
            _ => Err(DaqError::Configuration(format!(
                "Invalid SMU drive mode '{value}'. Only \"CURRENT_DRIVEN\" and \"VOLTAGE_DRIVEN\" are allowed."
            ))),
        }
    }
}

impl fmt::Display for DriveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveMode::CurrentDriven => write!(f, "current driven"),
            DriveMode::VoltageDriven => write!(f, "voltage driven"),
        }
    }
}

/// Compliance limits pushed to the SMU before output is enabled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplianceLimits {
    /// Maximum voltage magnitude (V)
    pub voltage_max: f64,
    /// Maximum current magnitude (A)
    pub current_max: f64,
}

impl ComplianceLimits {
    /// Each limit is the smaller absolute bound of the configured range.
    pub fn from_ranges(voltage_range: [f64; 2], current_range: [f64; 2]) -> Self {
        Self {
            voltage_max: voltage_range[0].abs().min(voltage_range[1].abs()),
            current_max: current_range[0].abs().min(current_range[1].abs()),
        }
    }
}

/// Inclusive actuation bounds of a line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Lowest permitted value
    pub min: f64,
    /// Highest permitted value
    pub max: f64,
}

impl Bounds {
    /// Bounds from a `[min, max]` pair.
    pub fn from_pair(pair: [f64; 2]) -> Self {
        Self {
            min: pair[0],
            max: pair[1],
        }
    }

    /// Whether `value` lies within the bounds.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Error for a setpoint outside the bounds on `device`.
    pub(crate) fn check(&self, device: &str, value: f64) -> DaqResult<()> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(DaqError::OutOfBounds {
                device: device.to_string(),
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// Kind of finite acquisition on an input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    /// Voltage input channel
    Voltage,
    /// Current input channel
    Current,
}

/// Blocking, SCPI-level control of one source-measure unit.
///
/// Implementations talk to exactly one physical device. Ramping, mode gating
/// and compliance policy live in [`SourceMeasureUnit`], not here.
pub trait SmuDriver: Send {
    /// Identification string of the instrument.
    fn identify(&mut self) -> BusResult<String>;

    /// Reset the instrument to its power-on defaults.
    fn reset(&mut self) -> BusResult<()>;

    /// Clear the status and error queues.
    fn clear(&mut self) -> BusResult<()>;

    /// Select the sourced quantity.
    fn select_source(&mut self, mode: DriveMode) -> BusResult<()>;

    /// Push compliance limits for both quantities.
    fn set_compliance(&mut self, limits: ComplianceLimits) -> BusResult<()>;

    /// Energize the output terminals.
    fn enable_output(&mut self) -> BusResult<()>;

    /// De-energize the output terminals.
    fn disable_output(&mut self) -> BusResult<()>;

    /// Route measurements through the front-panel terminals.
    fn use_front_terminals(&mut self) -> BusResult<()>;

    /// Per-sample integration time, source settle delay and trigger count.
    fn configure_integration(
        &mut self,
        nplc: f64,
        source_delay: Duration,
        trigger_count: u32,
    ) -> BusResult<()>;

    /// Set the sourced current level (A).
    fn source_current(&mut self, amps: f64) -> BusResult<()>;

    /// Set the sourced voltage level (V).
    fn source_voltage(&mut self, volts: f64) -> BusResult<()>;

    /// Single-shot voltage reading; `None` if the device returned no data.
    fn read_voltage(&mut self) -> BusResult<Option<f64>>;

    /// Single-shot current reading; `None` if the device returned no data.
    fn read_current(&mut self) -> BusResult<Option<f64>>;
}

/// Locates and connects to a source-measure unit by its address string.
pub trait SmuConnector {
    /// Connect to `device_id`, waiting at most `timeout`.
    ///
    /// Returns `DeviceNotFound` if nothing answers at the address.
    fn connect(&self, device_id: &str, timeout: Duration) -> DaqResult<Box<dyn SmuDriver>>;
}

/// Blocking access to the modules of a DAQ chassis.
///
/// Lines are addressed by physical name, `"{module}/ao{id}"` for outputs and
/// `"{module}/ai{id}"` for inputs.
pub trait AnalogBus: Send + Sync {
    /// Names of the modules currently attached to the chassis.
    fn module_names(&self) -> BusResult<Vec<String>>;

    /// Reset a module to its idle defaults.
    fn reset_module(&self, module: &str) -> BusResult<()>;

    /// Write samples to an output line.
    ///
    /// One sample is an immediate single-step actuation; several samples are
    /// issued as one continuous burst at `update_rate` Hz. Returns only once
    /// the whole burst has been generated.
    fn write(&self, line: &str, bounds: Bounds, samples: &[f64], update_rate: f64)
        -> BusResult<()>;

    /// Finite acquisition of `count` samples at `rate` Hz on an input line.
    fn read(&self, line: &str, kind: InputKind, count: usize, rate: f64) -> BusResult<Vec<f64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_mode_parses_config_strings() {
        assert_eq!(
            "CURRENT_DRIVEN".parse::<DriveMode>().unwrap(),
            DriveMode::CurrentDriven
        );
        assert_eq!(
            "voltage_driven".parse::<DriveMode>().unwrap(),
            DriveMode::VoltageDriven
        );
        assert!(matches!(
            "CURENT_DRIVEN".parse::<DriveMode>(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn compliance_uses_smaller_magnitude() {
        let limits = ComplianceLimits::from_ranges([-1.2, 0.8], [-1e-6, 5e-6]);
        assert_eq!(limits.voltage_max, 0.8);
        assert_eq!(limits.current_max, 1e-6);
    }

    #[test]
    fn bounds_are_inclusive() {
        let b = Bounds::from_pair([-1.0, 1.0]);
        assert!(b.contains(-1.0));
        assert!(b.contains(1.0));
        assert!(!b.contains(1.0001));
        assert!(b.check("ao0", 2.0).is_err());
    }
}

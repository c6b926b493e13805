//! Sweep strategies.
//!
//! One controller skeleton serves every experiment variant; the strategy
//! decides which device is actuated per step and what is read back.

use std::fmt;

use crate::config::{ExperimentConfig, StrategyKind};
use crate::error::{DaqError, DaqResult};
use crate::hardware::{ChannelId, DaqChassis, DriveMode, SourceMeasureUnit};

/// What a sweep actuates and samples per step. Fixed for a controller's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStrategy {
    /// Source SMU current, read SMU voltage and the whole chassis readout set.
    CurrentSweepWithChassisReadback,
    /// Source SMU voltage, read SMU current and one chassis readout channel.
    VoltageSweepWithChannelReadback {
        /// Readout channel sampled per step
        readout: ChannelId,
    },
    /// Drive one activation channel, sample one readout channel.
    ChassisOnly {
        /// Activation channel swept
        activation: ChannelId,
        /// Readout channel sampled per step
        readout: ChannelId,
    },
}

impl SweepStrategy {
    /// Build the strategy selected in the `experiment` section.
    pub fn from_config(config: &ExperimentConfig) -> DaqResult<Self> {
        let readout = || {
            config.readout_channel.ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Strategy {:?} requires experiment.readout_channel",
                    config.strategy
                ))
            })
        };
        match config.strategy {
            StrategyKind::CurrentSweep => Ok(SweepStrategy::CurrentSweepWithChassisReadback),
            StrategyKind::VoltageSweep => Ok(SweepStrategy::VoltageSweepWithChannelReadback {
                readout: readout()?,
            }),
            StrategyKind::ChassisOnly => Ok(SweepStrategy::ChassisOnly {
                activation: config.activation_channel.ok_or_else(|| {
                    DaqError::Configuration(
                        "Strategy ChassisOnly requires experiment.activation_channel".to_string(),
                    )
                })?,
                readout: readout()?,
            }),
        }
    }

    /// Whether the sweep drives the SMU.
    pub fn uses_smu(&self) -> bool {
        !matches!(self, SweepStrategy::ChassisOnly { .. })
    }

    /// Drive mode the SMU must be bound to, if one is used.
    pub fn required_drive_mode(&self) -> Option<DriveMode> {
        match self {
            SweepStrategy::CurrentSweepWithChassisReadback => Some(DriveMode::CurrentDriven),
            SweepStrategy::VoltageSweepWithChannelReadback { .. } => Some(DriveMode::VoltageDriven),
            SweepStrategy::ChassisOnly { .. } => None,
        }
    }

    /// Check the owned devices can carry out this strategy.
    ///
    /// Every strategy samples the chassis, so a chassis is always required.
    pub fn validate(
        &self,
        smu: Option<&SourceMeasureUnit>,
        chassis: Option<&DaqChassis>,
    ) -> DaqResult<()> {
        if let Some(required) = self.required_drive_mode() {
            let smu = smu.ok_or_else(|| {
                DaqError::Configuration(format!("Strategy '{self}' needs an SMU"))
            })?;
            if smu.mode() != required {
                return Err(DaqError::Configuration(format!(
                    "Strategy '{self}' needs a {required} SMU, but {} is {}",
                    smu.device_id(),
                    smu.mode()
                )));
            }
        }

        let chassis = chassis.ok_or_else(|| {
            DaqError::Configuration(format!("Strategy '{self}' needs a DAQ chassis"))
        })?;

        let (activation, readout) = match *self {
            SweepStrategy::CurrentSweepWithChassisReadback => (None, None),
            SweepStrategy::VoltageSweepWithChannelReadback { readout } => (None, Some(readout)),
            SweepStrategy::ChassisOnly {
                activation,
                readout,
            } => (Some(activation), Some(readout)),
        };
        if let Some(id) = activation {
            if chassis.activation_channel(id).is_none() {
                return Err(DaqError::Configuration(format!(
                    "Sweep channel {}/ao{id} is not a configured activation channel",
                    chassis.activation_module()
                )));
            }
        }
        if let Some(id) = readout {
            if chassis.readout_channel(id).is_none() {
                return Err(DaqError::Configuration(format!(
                    "Sweep channel {}/ai{id} is not a configured readout channel",
                    chassis.readout_module()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for SweepStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepStrategy::CurrentSweepWithChassisReadback => write!(f, "current sweep"),
            SweepStrategy::VoltageSweepWithChannelReadback { readout } => {
                write!(f, "voltage sweep (readout ai{readout})")
            }
            SweepStrategy::ChassisOnly {
                activation,
                readout,
            } => write!(f, "chassis sweep (ao{activation} -> ai{readout})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_from_experiment_section() {
        let mut config = ExperimentConfig::default();
        assert_eq!(
            SweepStrategy::from_config(&config).unwrap(),
            SweepStrategy::CurrentSweepWithChassisReadback
        );

        config.strategy = StrategyKind::VoltageSweep;
        assert!(SweepStrategy::from_config(&config).is_err());
        config.readout_channel = Some(4);
        assert_eq!(
            SweepStrategy::from_config(&config).unwrap(),
            SweepStrategy::VoltageSweepWithChannelReadback { readout: 4 }
        );

        config.strategy = StrategyKind::ChassisOnly;
        assert!(SweepStrategy::from_config(&config).is_err());
        config.activation_channel = Some(1);
        let strategy = SweepStrategy::from_config(&config).unwrap();
        assert!(!strategy.uses_smu());
        assert_eq!(strategy.required_drive_mode(), None);
    }

    #[test]
    fn smu_strategies_require_matching_mode() {
        assert_eq!(
            SweepStrategy::CurrentSweepWithChassisReadback.required_drive_mode(),
            Some(DriveMode::CurrentDriven)
        );
        let voltage = SweepStrategy::VoltageSweepWithChannelReadback { readout: 0 };
        assert_eq!(voltage.required_drive_mode(), Some(DriveMode::VoltageDriven));
        assert!(matches!(
            voltage.validate(None, None),
            Err(DaqError::Configuration(_))
        ));
    }
}

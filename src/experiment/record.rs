//! Per-step results of a sweep.

use crate::error::DaqError;
use crate::experiment::SweepStrategy;
use crate::hardware::{ChannelId, ChannelReadings};

/// Values read back in one completed step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readback {
    /// SMU readback of the non-driven quantity
    pub smu: Option<f64>,
    /// Chassis voltage readings
    pub voltages: ChannelReadings,
    /// Chassis current readings
    pub currents: ChannelReadings,
}

/// How a step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// All readings were taken
    Complete(Readback),
    /// A recoverable failure left no data for this step
    Gap {
        /// Error class, see [`DaqError::kind`]
        kind: &'static str,
        /// Error message
        reason: String,
    },
}

/// One consumed setpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Position in the setpoint sequence (0-based)
    pub index: usize,
    /// Commanded setpoint
    pub setpoint: f64,
    /// Result of the step
    pub outcome: StepOutcome,
}

impl StepRecord {
    /// Readback of a completed step.
    pub fn readback(&self) -> Option<&Readback> {
        match &self.outcome {
            StepOutcome::Complete(readback) => Some(readback),
            StepOutcome::Gap { .. } => None,
        }
    }

    /// Whether this step is a gap.
    pub fn is_gap(&self) -> bool {
        matches!(self.outcome, StepOutcome::Gap { .. })
    }
}

/// Ordered per-step records of one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRun {
    strategy: SweepStrategy,
    steps: Vec<StepRecord>,
}

impl ExperimentRun {
    /// Empty run for `strategy`.
    pub fn new(strategy: SweepStrategy) -> Self {
        Self {
            strategy,
            steps: Vec::new(),
        }
    }

    pub(crate) fn push_complete(&mut self, index: usize, setpoint: f64, readback: Readback) {
        self.steps.push(StepRecord {
            index,
            setpoint,
            outcome: StepOutcome::Complete(readback),
        });
    }

    pub(crate) fn push_gap(&mut self, index: usize, setpoint: f64, error: &DaqError) {
        self.steps.push(StepRecord {
            index,
            setpoint,
            outcome: StepOutcome::Gap {
                kind: error.kind(),
                reason: error.to_string(),
            },
        });
    }

    /// Strategy the run was recorded with.
    pub fn strategy(&self) -> SweepStrategy {
        self.strategy
    }

    /// All records in setpoint order.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Number of consumed setpoints.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no setpoint was consumed.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps with data.
    pub fn complete_count(&self) -> usize {
        self.steps.iter().filter(|s| !s.is_gap()).count()
    }

    /// Steps without data.
    pub fn gaps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| s.is_gap())
    }

    /// Chassis voltage rows, `NaN` for every channel of a gap.
    pub fn voltage_rows(&self, channels: &[ChannelId]) -> Vec<ChannelReadings> {
        self.readings_rows(channels, |r| &r.voltages)
    }

    /// Chassis current rows, `NaN` for every channel of a gap.
    pub fn current_rows(&self, channels: &[ChannelId]) -> Vec<ChannelReadings> {
        self.readings_rows(channels, |r| &r.currents)
    }

    fn readings_rows<F>(&self, channels: &[ChannelId], pick: F) -> Vec<ChannelReadings>
    where
        F: Fn(&Readback) -> &ChannelReadings,
    {
        self.steps
            .iter()
            .map(|step| match step.readback() {
                Some(readback) => pick(readback).clone(),
                None => channels.iter().map(|id| (*id, f64::NAN)).collect(),
            })
            .collect()
    }

    /// `(setpoint, SMU readback)` pairs.
    pub fn source_readback_rows(&self) -> Vec<(f64, f64)> {
        self.steps
            .iter()
            .map(|step| {
                let value = step.readback().and_then(|r| r.smu).unwrap_or(f64::NAN);
                (step.setpoint, value)
            })
            .collect()
    }

    /// `[setpoint, SMU current, channel current]` rows, or
    /// `[setpoint, channel current]` when no SMU was involved.
    pub fn current_matrix(&self, readout: ChannelId) -> Vec<Vec<f64>> {
        let with_smu = self.strategy.uses_smu();
        self.steps
            .iter()
            .map(|step| {
                let readback = step.readback();
                let channel = readback
                    .and_then(|r| r.currents.get(&readout).copied())
                    .unwrap_or(f64::NAN);
                if with_smu {
                    let smu = readback.and_then(|r| r.smu).unwrap_or(f64::NAN);
                    vec![step.setpoint, smu, channel]
                } else {
                    vec![step.setpoint, channel]
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> ExperimentRun {
        let mut run =
            ExperimentRun::new(SweepStrategy::VoltageSweepWithChannelReadback { readout: 1 });
        run.push_complete(
            0,
            0.1,
            Readback {
                smu: Some(1e-6),
                currents: [(1, 2e-9)].into_iter().collect(),
                ..Default::default()
            },
        );
        run.push_gap(
            1,
            0.2,
            &DaqError::NoMeasurement {
                device: "SMU".into(),
            },
        );
        run
    }

    #[test]
    fn counts_and_gaps() {
        let run = run();
        assert_eq!(run.len(), 2);
        assert_eq!(run.complete_count(), 1);
        let gaps: Vec<_> = run.gaps().collect();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].index, 1);
        assert!(matches!(
            gaps[0].outcome,
            StepOutcome::Gap {
                kind: "no_measurement",
                ..
            }
        ));
    }

    #[test]
    fn gaps_become_nan_rows() {
        let run = run();
        let matrix = run.current_matrix(1);
        assert_eq!(matrix[0], vec![0.1, 1e-6, 2e-9]);
        assert_eq!(matrix[1][0], 0.2);
        assert!(matrix[1][1].is_nan() && matrix[1][2].is_nan());

        let rows = run.current_rows(&[1, 3]);
        assert!(rows[1][&3].is_nan());
        assert_eq!(rows[1].len(), 2);
    }
}

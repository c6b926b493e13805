//! Where sweep results go.
//!
//! A sweep hands its accumulated results to an [`ExperimentSink`] exactly once,
//! at completion or abandonment. The sink also supplies the setpoint sequence
//! and the operator confirmation gate.
//!
//! - [`MemorySink`] keeps everything in memory (tests, embedding)
//! - [`RunFolder`] writes a timestamped folder of CSV files per run

use std::collections::VecDeque;

use crate::error::DaqResult;
use crate::hardware::ChannelReadings;

pub mod run_folder;

pub use run_folder::RunFolder;

/// Outcome of an operator confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorDecision {
    /// Proceed with the run
    Continue,
    /// Stop before anything is energized
    Abort,
}

/// Blocking operator confirmation.
pub trait OperatorGate {
    /// Show `prompt` and block until the operator answers.
    fn wait_for_user_input(&mut self, prompt: &str) -> DaqResult<OperatorDecision>;
}

/// Destination for sweep results.
///
/// Every `write_*` call receives one row per setpoint, in setpoint order.
/// Steps that produced no data arrive as rows of `NaN`.
pub trait ExperimentSink: OperatorGate {
    /// Setpoint sequence for the run.
    fn get_input_data(&self) -> DaqResult<Vec<f64>>;

    /// Per-step chassis voltage readings.
    fn write_voltage(&mut self, rows: &[ChannelReadings]) -> DaqResult<()>;

    /// Per-step chassis current readings.
    fn write_current(&mut self, rows: &[ChannelReadings]) -> DaqResult<()>;

    /// Per-step current rows with a strategy-defined column layout.
    fn write_current_matrix(&mut self, rows: &[Vec<f64>]) -> DaqResult<()>;

    /// Per-step `(setpoint, source readback)` pairs from the SMU.
    fn write_source_readback(&mut self, rows: &[(f64, f64)]) -> DaqResult<()>;
}

/// In-memory sink with scripted operator answers.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    /// Setpoints returned by `get_input_data`
    pub input: Vec<f64>,
    /// Answers handed out in order; `Continue` once exhausted
    pub decisions: VecDeque<OperatorDecision>,
    /// Prompts shown so far
    pub prompts: Vec<String>,
    /// Last `write_voltage` payload
    pub voltage: Option<Vec<ChannelReadings>>,
    /// Last `write_current` payload
    pub current: Option<Vec<ChannelReadings>>,
    /// Last `write_current_matrix` payload
    pub current_matrix: Option<Vec<Vec<f64>>>,
    /// Last `write_source_readback` payload
    pub source_readback: Option<Vec<(f64, f64)>>,
    /// Number of `write_*` calls received
    pub flushes: usize,
}

impl MemorySink {
    /// Sink supplying `input` as the setpoint sequence.
    pub fn new(input: Vec<f64>) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    /// Queue an operator answer.
    pub fn with_decision(mut self, decision: OperatorDecision) -> Self {
        self.decisions.push_back(decision);
        self
    }
}

impl OperatorGate for MemorySink {
    fn wait_for_user_input(&mut self, prompt: &str) -> DaqResult<OperatorDecision> {
        self.prompts.push(prompt.to_string());
        Ok(self
            .decisions
            .pop_front()
            .unwrap_or(OperatorDecision::Continue))
    }
}

impl ExperimentSink for MemorySink {
    fn get_input_data(&self) -> DaqResult<Vec<f64>> {
        Ok(self.input.clone())
    }

    fn write_voltage(&mut self, rows: &[ChannelReadings]) -> DaqResult<()> {
        self.flushes += 1;
        self.voltage = Some(rows.to_vec());
        Ok(())
    }

    fn write_current(&mut self, rows: &[ChannelReadings]) -> DaqResult<()> {
        self.flushes += 1;
        self.current = Some(rows.to_vec());
        Ok(())
    }

    fn write_current_matrix(&mut self, rows: &[Vec<f64>]) -> DaqResult<()> {
        self.flushes += 1;
        self.current_matrix = Some(rows.to_vec());
        Ok(())
    }

    fn write_source_readback(&mut self, rows: &[(f64, f64)]) -> DaqResult<()> {
        self.flushes += 1;
        self.source_readback = Some(rows.to_vec());
        Ok(())
    }
}

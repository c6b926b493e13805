//! Sweep orchestration.
//!
//! - [`ExperimentController`]: owns the devices and runs one sweep
//! - [`SweepStrategy`]: what is actuated and sampled per step
//! - [`ControllerState`]: lifecycle state machine
//! - [`ExperimentRun`]: per-step records, with gaps for failed steps
//! - [`InterruptFlag`]: cooperative cancellation between steps

pub mod controller;
pub mod record;
pub mod safety;
pub mod state;
pub mod strategy;

pub use controller::ExperimentController;
pub use record::{ExperimentRun, Readback, StepOutcome, StepRecord};
pub use safety::{InterruptFlag, ShutdownLatch, ShutdownPath};
pub use state::ControllerState;
pub use strategy::SweepStrategy;

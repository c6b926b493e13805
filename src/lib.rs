//! # RNPU Sweep Core Library
//!
//! Electrical characterization sweeps against a source-measure unit (SMU) and
//! a multi-channel DAQ chassis. The library commands setpoints, samples
//! readback and records results, while keeping the devices inside their
//! safety envelope on every exit path.
//!
//! ## Crate Structure
//!
//! - **`waveform`**: setpoint sequence generation (linear, sawtooth, multi-phase).
//! - **`hardware`**: driver seams (`SmuDriver`, `AnalogBus`), the device roles
//!   (`SourceMeasureUnit`, `DaqChassis`, `DeviceChannel`), the SCPI driver and
//!   simulated devices.
//! - **`experiment`**: the sweep controller, its strategies and state machine,
//!   and per-step result records.
//! - **`sink`**: result destinations and the operator confirmation gate.
//! - **`config`**: figment-based setup configuration.
//! - **`context`**: the run context passed to every component.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the crate-wide `DaqError`.
//!
//! The library is synchronous and blocking throughout. Hosting it in an async
//! runtime is the binary's concern.

pub mod config;
pub mod context;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod sink;
pub mod waveform;

pub use context::Context;
pub use error::{DaqError, DaqResult};

//! Sweep controller.
//!
//! The [`ExperimentController`] owns the devices of one run and drives them
//! through a [`SweepStrategy`]. It guarantees that the devices are returned
//! to idle exactly once, from whichever exit path is reached first:
//!
//! - the end of [`run`](ExperimentController::run), success or error
//! - an explicit [`shutdown`](ExperimentController::shutdown)
//! - `Drop`, as a last resort
//!
//! Per-step failures that are not fatal (see [`DaqError::is_fatal`]) become
//! gaps in the [`ExperimentRun`]; the sweep continues.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::{DaqError, DaqResult};
use crate::experiment::record::{ExperimentRun, Readback};
use crate::experiment::safety::{InterruptFlag, ShutdownLatch, ShutdownPath};
use crate::experiment::{ControllerState, SweepStrategy};
use crate::hardware::{Actuation, AnalogBus, DaqChassis, SmuConnector, SourceMeasureUnit};
use crate::sink::{ExperimentSink, OperatorGate};

/// Owns the devices of one run and executes its sweep.
pub struct ExperimentController {
    smu: Option<SourceMeasureUnit>,
    chassis: Option<DaqChassis>,
    strategy: SweepStrategy,
    state: ControllerState,
    latch: ShutdownLatch,
    interrupt: InterruptFlag,
}

impl ExperimentController {
    /// Take ownership of already constructed devices.
    ///
    /// If the devices cannot carry out `strategy`, they are shut down and a
    /// `Configuration` error is returned.
    pub fn new(
        ctx: &Context,
        strategy: SweepStrategy,
        mut smu: Option<SourceMeasureUnit>,
        mut chassis: Option<DaqChassis>,
    ) -> DaqResult<Self> {
        if let Err(err) = strategy.validate(smu.as_ref(), chassis.as_ref()) {
            error!(strategy = %strategy, error = %err, "Devices do not match the sweep strategy");
            if let Some(chassis) = chassis.as_mut() {
                if let Err(shutdown_err) = chassis.shutdown() {
                    error!(error = %shutdown_err, "Chassis did not return to idle");
                }
            }
            if let Some(smu) = smu.as_mut() {
                if let Err(shutdown_err) = smu.shutdown() {
                    error!(error = %shutdown_err, "SMU did not return to idle");
                }
            }
            return Err(err);
        }

        info!(strategy = %strategy, "Experiment controller ready");
        Ok(Self {
            smu,
            chassis,
            strategy,
            state: ControllerState::Idle,
            latch: ShutdownLatch::new(),
            interrupt: ctx.interrupt().clone(),
        })
    }

    /// Build every device the configured strategy needs, then the controller.
    ///
    /// The chassis is built first since its construction only zeroes lines;
    /// the SMU, which enables its output, comes last. A failure shuts down
    /// whatever was already built.
    pub fn connect(
        ctx: &Context,
        connector: &dyn SmuConnector,
        bus: Arc<dyn AnalogBus>,
        gate: Option<&mut dyn OperatorGate>,
    ) -> DaqResult<Self> {
        let config = ctx.config();
        let strategy = SweepStrategy::from_config(&config.experiment)?;

        let mut chassis = match &config.daq {
            Some(_) => Some(DaqChassis::new(config, bus)?),
            None => None,
        };

        let smu = if strategy.uses_smu() {
            match SourceMeasureUnit::connect(config, connector, gate) {
                Ok(smu) => Some(smu),
                Err(err) => {
                    if let Some(chassis) = chassis.as_mut() {
                        if let Err(shutdown_err) = chassis.shutdown() {
                            error!(error = %shutdown_err, "Chassis did not return to idle");
                        }
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        Self::new(ctx, strategy, smu, chassis)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Strategy fixed at construction.
    pub fn strategy(&self) -> SweepStrategy {
        self.strategy
    }

    /// Owned SMU, if any.
    pub fn smu(&self) -> Option<&SourceMeasureUnit> {
        self.smu.as_ref()
    }

    /// Owned chassis, if any.
    pub fn chassis(&self) -> Option<&DaqChassis> {
        self.chassis.as_ref()
    }

    /// Exit path that fired the shutdown hook, if it has fired.
    pub fn shutdown_fired_from(&self) -> Option<ShutdownPath> {
        self.latch.fired_from()
    }

    /// Run the sweep over `setpoints` and flush the results to `sink`.
    ///
    /// Devices are shut down before this returns, whatever the outcome.
    /// An honored interrupt flushes the partial results and returns
    /// [`DaqError::Interrupted`].
    pub fn run(
        &mut self,
        setpoints: &[f64],
        sink: &mut dyn ExperimentSink,
    ) -> DaqResult<ExperimentRun> {
        let outcome = self.execute(setpoints, sink);
        let path = match outcome {
            Ok(_) => ShutdownPath::Normal,
            Err(_) => ShutdownPath::ErrorExit,
        };
        let shutdown = self.fire_shutdown(path);

        match (outcome, shutdown) {
            (Ok(run), Ok(())) => Ok(run),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Err(shutdown_err)) => {
                error!(error = %shutdown_err, "Shutdown after failed run was incomplete");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }

    /// Return every device to idle. Only the first call has any effect.
    pub fn shutdown(&mut self) -> DaqResult<()> {
        self.fire_shutdown(ShutdownPath::Normal)
    }

    fn transition(&mut self, next: ControllerState) -> DaqResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DaqError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "Controller transition");
        self.state = next;
        Ok(())
    }

    fn execute(
        &mut self,
        setpoints: &[f64],
        sink: &mut dyn ExperimentSink,
    ) -> DaqResult<ExperimentRun> {
        self.transition(ControllerState::Initializing)?;
        if let Some(chassis) = self.chassis.as_mut() {
            if let Err(err) = chassis.start_active_all_channels() {
                warn!(error = %err, "Not every activation channel reached its control voltage");
            }
        }

        self.transition(ControllerState::Sweeping)?;
        let total = setpoints.len();
        info!(strategy = %self.strategy, steps = total, "Sweep started");

        let mut run = ExperimentRun::new(self.strategy);
        let mut abandoned = None;
        for (index, &setpoint) in setpoints.iter().enumerate() {
            if self.interrupt.is_triggered() {
                warn!(
                    completed = run.len(),
                    reason = %self.interrupt.reason().unwrap_or_default(),
                    "Sweep interrupted"
                );
                abandoned = Some(DaqError::Interrupted {
                    completed: run.len(),
                });
                break;
            }

            match self.step(setpoint) {
                Ok(readback) => run.push_complete(index, setpoint, readback),
                Err(err) if !err.is_fatal() => {
                    warn!(step = index + 1, setpoint, error = %err, "Step recorded as gap");
                    run.push_gap(index, setpoint, &err);
                }
                Err(err) => {
                    error!(step = index + 1, setpoint, error = %err, "Sweep aborted");
                    abandoned = Some(err);
                    break;
                }
            }
            info!(step = index + 1, total, setpoint, "Sweep progress");
        }

        self.transition(ControllerState::Finalizing)?;
        let flushed = self.flush(&run, sink);
        match (abandoned, flushed) {
            (None, Ok(())) => {
                info!(
                    complete = run.complete_count(),
                    gaps = run.len() - run.complete_count(),
                    "Sweep finished"
                );
                Ok(run)
            }
            (None, Err(err)) => Err(err),
            (Some(err), Ok(())) => Err(err),
            (Some(err), Err(flush_err)) => {
                error!(error = %flush_err, "Failed to flush partial results");
                Err(err)
            }
        }
    }

    fn step(&mut self, setpoint: f64) -> DaqResult<Readback> {
        match self.strategy {
            SweepStrategy::CurrentSweepWithChassisReadback => {
                let smu = self.smu_mut()?;
                if let Actuation::Ignored { attempted } = smu.set_current(setpoint)? {
                    return Err(smu.mismatch(attempted));
                }
                let volts = smu.measure_voltage()?;
                let chassis = self.chassis_mut()?;
                Ok(Readback {
                    smu: Some(volts),
                    voltages: chassis.measure_voltage_all_channels()?,
                    currents: chassis.measure_current_all_channels()?,
                })
            }
            SweepStrategy::VoltageSweepWithChannelReadback { readout } => {
                let smu = self.smu_mut()?;
                if let Actuation::Ignored { attempted } = smu.set_voltage(setpoint)? {
                    return Err(smu.mismatch(attempted));
                }
                let amps = smu.measure_current()?;
                let channel = self.chassis_mut()?.measure_current(readout)?;
                Ok(Readback {
                    smu: Some(amps),
                    currents: [(readout, channel)].into_iter().collect(),
                    ..Default::default()
                })
            }
            SweepStrategy::ChassisOnly {
                activation,
                readout,
            } => {
                let chassis = self.chassis_mut()?;
                chassis.set_voltage(activation, setpoint, true)?;
                let channel = chassis.measure_current(readout)?;
                Ok(Readback {
                    currents: [(readout, channel)].into_iter().collect(),
                    ..Default::default()
                })
            }
        }
    }

    fn smu_mut(&mut self) -> DaqResult<&mut SourceMeasureUnit> {
        self.smu
            .as_mut()
            .ok_or_else(|| DaqError::Configuration("Sweep strategy needs an SMU".to_string()))
    }

    fn chassis_mut(&mut self) -> DaqResult<&mut DaqChassis> {
        self.chassis
            .as_mut()
            .ok_or_else(|| DaqError::Configuration("Sweep strategy needs a DAQ chassis".to_string()))
    }

    fn flush(&self, run: &ExperimentRun, sink: &mut dyn ExperimentSink) -> DaqResult<()> {
        match self.strategy {
            SweepStrategy::CurrentSweepWithChassisReadback => {
                let channels = self
                    .chassis
                    .as_ref()
                    .map(DaqChassis::readout_ids)
                    .unwrap_or_default();
                if !channels.is_empty() {
                    sink.write_voltage(&run.voltage_rows(&channels))?;
                    sink.write_current(&run.current_rows(&channels))?;
                }
                sink.write_source_readback(&run.source_readback_rows())
            }
            SweepStrategy::VoltageSweepWithChannelReadback { readout }
            | SweepStrategy::ChassisOnly { readout, .. } => {
                sink.write_current_matrix(&run.current_matrix(readout))
            }
        }
    }

    fn fire_shutdown(&mut self, path: ShutdownPath) -> DaqResult<()> {
        if !self.latch.try_fire(path) {
            return Ok(());
        }
        self.state = ControllerState::Shutdown;

        let mut errors = Vec::new();
        if let Some(chassis) = self.chassis.as_mut() {
            if let Err(err) = chassis.shutdown() {
                errors.push(err);
            }
        }
        if let Some(smu) = self.smu.as_mut() {
            if let Err(err) = smu.shutdown() {
                errors.push(err);
            }
        }

        if errors.is_empty() {
            info!(path = %path, "Devices returned to idle");
            Ok(())
        } else {
            error!(path = %path, failed = errors.len(), "Devices did not all return to idle");
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl Drop for ExperimentController {
    fn drop(&mut self) {
        if !self.latch.has_fired() {
            warn!("Controller dropped without shutdown, returning devices to idle");
            if let Err(err) = self.fire_shutdown(ShutdownPath::Fallback) {
                error!(error = %err, "Fallback shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for ExperimentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentController")
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .field("smu", &self.smu)
            .field("chassis", &self.chassis)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SetupConfig;
    use crate::hardware::mock::{SimulatedBus, SimulatedSmu, SimulatedSmuConnector};
    use tracing_test::traced_test;

    const DEVICE: &str = "GPIB0::15::INSTR";

    fn config() -> SetupConfig {
        SetupConfig::from_yaml_str(&format!(
            r#"
name: controller-test
voltage_range: [-1.0, 1.0]
current_range: [-1.0e-6, 1.0e-6]
min_value: -5.0e-7
max_value: 5.0e-7
data_density: 2
ramp_points: 2
smu:
  device_id: "{DEVICE}"
  drive_mode: CURRENT_DRIVEN
  confirm_before_output: false
daq:
  activation_module_id: cDAQ1Mod1
  readout_module_id: cDAQ1Mod2
  sample_frequency: 1000
  update_frequency: 1000
  samples_per_measurement: 1
  control_voltages:
    0: 0.2
  readout_channels: [1]
"#
        ))
        .unwrap()
    }

    #[test]
    #[traced_test]
    fn rejected_devices_report_shutdown_faults() {
        let config = config();
        let ctx = Context::new(config.clone()).unwrap();
        let bus = SimulatedBus::new(["cDAQ1Mod1", "cDAQ1Mod2"]);
        let chassis = DaqChassis::new(&config, Arc::new(bus.clone())).unwrap();
        let sim = SimulatedSmu::new(DEVICE, 1.0e6);
        let connector = SimulatedSmuConnector::new().with_device(DEVICE, sim.clone());
        let smu = SourceMeasureUnit::connect(&config, &connector, None).unwrap();
        bus.fail_writes_on("cDAQ1Mod1/ao0");

        let strategy = SweepStrategy::VoltageSweepWithChannelReadback { readout: 1 };
        let result = ExperimentController::new(&ctx, strategy, Some(smu), Some(chassis));

        assert!(matches!(result, Err(DaqError::Configuration(_))));
        assert!(!sim.output_enabled());
        assert!(logs_contain("Chassis did not return to idle"));
    }

    #[test]
    fn current_sweep_without_chassis_is_rejected() {
        let config = config();
        let ctx = Context::new(config.clone()).unwrap();
        let sim = SimulatedSmu::new(DEVICE, 1.0e6);
        let connector = SimulatedSmuConnector::new().with_device(DEVICE, sim.clone());
        let smu = SourceMeasureUnit::connect(&config, &connector, None).unwrap();

        let result = ExperimentController::new(
            &ctx,
            SweepStrategy::CurrentSweepWithChassisReadback,
            Some(smu),
            None,
        );

        assert!(matches!(result, Err(DaqError::Configuration(_))));
        assert!(!sim.output_enabled());
    }
}

//! Drive-mode gated source-measure unit.
//!
//! A [`SourceMeasureUnit`] is bound to one [`DriveMode`] for its whole life.
//! Only the matching actuation changes physical state; the other one logs a
//! single warning and returns [`Actuation::Ignored`].
//!
//! # Construction order
//!
//! ```text
//! connect -> *RST / *CLS -> source function -> compliance
//!         -> [operator gate] -> output on -> front terminals -> NPLC / delay / trigger
//! ```
//!
//! Compliance is always pushed before output is enabled, and output is never
//! energized before the operator confirms when the gate is configured. A
//! failure in any step after output on switches the output back off before
//! the error is returned.

use std::fmt;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::SetupConfig;
use crate::error::{DaqError, DaqResult, Quantity};
use crate::hardware::{Bounds, ComplianceLimits, DriveMode, SmuConnector, SmuDriver};
use crate::sink::{OperatorDecision, OperatorGate};
use crate::waveform::ramp_profile;

/// Integration time per sample, in power line cycles.
pub const DEFAULT_NPLC: f64 = 1.0;

/// Settle delay between sourcing and measuring.
pub const DEFAULT_SOURCE_DELAY: Duration = Duration::from_millis(50);

/// Readings taken per trigger.
pub const DEFAULT_TRIGGER_COUNT: u32 = 1;

/// Result of a drive-mode gated actuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actuation {
    /// The setpoint was ramped to and is now sourced
    Applied,
    /// The request did not match the bound drive mode; nothing was sent
    Ignored {
        /// Quantity the caller tried to source
        attempted: Quantity,
    },
}

impl Actuation {
    /// Whether the setpoint reached the device.
    pub fn is_applied(&self) -> bool {
        matches!(self, Actuation::Applied)
    }
}

/// One source-measure unit with its safety policy.
pub struct SourceMeasureUnit {
    driver: Box<dyn SmuDriver>,
    device_id: String,
    mode: DriveMode,
    compliance: ComplianceLimits,
    current_bounds: Bounds,
    voltage_bounds: Bounds,
    ramp_points: usize,
    pause_between_set: Duration,
    last_commanded_value: f64,
    shut_down: bool,
}

impl SourceMeasureUnit {
    /// Connect to and configure the SMU described by `config.smu`.
    ///
    /// When `smu.confirm_before_output` is set and a `gate` is given, the
    /// operator is asked before the output is enabled; declining yields
    /// [`DaqError::OperatorAbort`].
    pub fn connect(
        config: &SetupConfig,
        connector: &dyn SmuConnector,
        gate: Option<&mut dyn OperatorGate>,
    ) -> DaqResult<Self> {
        let settings = config.smu.as_ref().ok_or_else(|| {
            DaqError::Configuration("No 'smu' section in setup configuration".to_string())
        })?;
        let device_id = settings.device_id.clone();

        let mut driver = connector.connect(&device_id, settings.timeout())?;
        match driver.identify() {
            Ok(idn) => info!(device = %device_id, idn = %idn.trim(), "SMU connected"),
            Err(fault) => warn!(device = %device_id, error = %fault, "SMU did not identify"),
        }

        driver.reset()?;
        driver.clear()?;

        let mode = settings.drive_mode()?;
        driver.select_source(mode)?;

        let compliance = ComplianceLimits::from_ranges(config.voltage_range, config.current_range);
        driver.set_compliance(compliance)?;
        info!(
            device = %device_id,
            mode = %mode,
            voltage_max = compliance.voltage_max,
            current_max = compliance.current_max,
            "SMU source configured"
        );

        if settings.confirm_before_output {
            if let Some(gate) = gate {
                let prompt = format!(
                    "SMU {device_id} is {mode} with compliance {} V / {} A. Enable output?",
                    compliance.voltage_max, compliance.current_max
                );
                if gate.wait_for_user_input(&prompt)? == OperatorDecision::Abort {
                    return Err(DaqError::OperatorAbort);
                }
            }
        }

        driver.enable_output()?;
        let finish = driver.use_front_terminals().and_then(|()| {
            driver.configure_integration(DEFAULT_NPLC, DEFAULT_SOURCE_DELAY, DEFAULT_TRIGGER_COUNT)
        });
        if let Err(fault) = finish {
            error!(device = %device_id, error = %fault, "SMU setup failed with output on");
            if let Err(off) = driver.disable_output() {
                error!(device = %device_id, error = %off, "Failed to disable SMU output");
            }
            return Err(fault.into());
        }
        info!(device = %device_id, "SMU output enabled");

        Ok(Self {
            driver,
            device_id,
            mode,
            compliance,
            current_bounds: Bounds::from_pair(config.current_range),
            voltage_bounds: Bounds::from_pair(config.voltage_range),
            ramp_points: config.ramp_points,
            pause_between_set: settings.pause_between_set(),
            last_commanded_value: 0.0,
            shut_down: false,
        })
    }

    /// Instrument address.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Bound drive mode.
    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    /// Compliance limits pushed at construction.
    pub fn compliance(&self) -> ComplianceLimits {
        self.compliance
    }

    /// Last confirmed source level.
    pub fn last_commanded_value(&self) -> f64 {
        self.last_commanded_value
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Ramp the sourced current to `amps`. Ignored unless current driven.
    pub fn set_current(&mut self, amps: f64) -> DaqResult<Actuation> {
        if self.mode != DriveMode::CurrentDriven {
            return Ok(self.ignore(Quantity::Current, amps));
        }
        self.current_bounds.check(&self.device_id, amps)?;
        self.ramp_to(amps)?;
        Ok(Actuation::Applied)
    }

    /// Ramp the sourced voltage to `volts`. Ignored unless voltage driven.
    pub fn set_voltage(&mut self, volts: f64) -> DaqResult<Actuation> {
        if self.mode != DriveMode::VoltageDriven {
            return Ok(self.ignore(Quantity::Voltage, volts));
        }
        self.voltage_bounds.check(&self.device_id, volts)?;
        self.ramp_to(volts)?;
        Ok(Actuation::Applied)
    }

    fn ignore(&self, attempted: Quantity, value: f64) -> Actuation {
        warn!(
            device = %self.device_id,
            mode = %self.mode,
            attempted = %attempted,
            value,
            "Ignoring out-of-mode actuation"
        );
        Actuation::Ignored { attempted }
    }

    /// Error describing an ignored actuation, for callers that require one.
    pub fn mismatch(&self, attempted: Quantity) -> DaqError {
        DaqError::ModeMismatch {
            device: self.device_id.clone(),
            mode: self.mode,
            attempted,
        }
    }

    fn ramp_to(&mut self, target: f64) -> DaqResult<()> {
        let profile = ramp_profile(self.last_commanded_value, target, self.ramp_points);
        for point in &profile {
            let sent = match self.mode {
                DriveMode::CurrentDriven => self.driver.source_current(*point),
                DriveMode::VoltageDriven => self.driver.source_voltage(*point),
            };
            if let Err(fault) = sent {
                error!(device = %self.device_id, level = point, error = %fault, "SMU ramp failed");
                return Err(fault.into());
            }
            if !self.pause_between_set.is_zero() {
                thread::sleep(self.pause_between_set);
            }
        }
        debug!(
            device = %self.device_id,
            from = self.last_commanded_value,
            to = target,
            "SMU ramp complete"
        );
        self.last_commanded_value = target;
        Ok(())
    }

    /// Single-shot voltage reading (V).
    pub fn measure_voltage(&mut self) -> DaqResult<f64> {
        let reading = self.driver.read_voltage();
        self.reading(reading)
    }

    /// Single-shot current reading (A).
    pub fn measure_current(&mut self) -> DaqResult<f64> {
        let reading = self.driver.read_current();
        self.reading(reading)
    }

    fn reading(&self, reading: crate::hardware::BusResult<Option<f64>>) -> DaqResult<f64> {
        match reading {
            Ok(Some(value)) => Ok(value),
            Ok(None) => {
                error!(device = %self.device_id, "SMU returned no data");
                Err(DaqError::NoMeasurement {
                    device: format!("SMU {}", self.device_id),
                })
            }
            Err(fault) => {
                error!(device = %self.device_id, error = %fault, "SMU measurement failed");
                Err(fault.into())
            }
        }
    }

    /// Whether both readings lie within their tolerances.
    pub fn is_calibrated(voltage: f64, current: f64, tol_v: f64, tol_i: f64) -> bool {
        voltage.abs() <= tol_v && current.abs() <= tol_i
    }

    /// Ramp the source to zero and de-energize the output.
    ///
    /// Only the first call talks to the device. The output is disabled even
    /// if the ramp faults.
    pub fn shutdown(&mut self) -> DaqResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let ramp = self.ramp_to(0.0);
        let off = self.driver.disable_output();
        if let Err(fault) = &off {
            error!(device = %self.device_id, error = %fault, "Failed to disable SMU output");
        }

        ramp?;
        off?;
        info!(device = %self.device_id, "SMU shutdown");
        Ok(())
    }
}

impl fmt::Debug for SourceMeasureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceMeasureUnit")
            .field("device_id", &self.device_id)
            .field("mode", &self.mode)
            .field("compliance", &self.compliance)
            .field("last_commanded_value", &self.last_commanded_value)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedSmu, SimulatedSmuConnector, SmuCommand};
    use crate::sink::MemorySink;
    use tracing_test::traced_test;

    const DEVICE: &str = "GPIB0::15::INSTR";

    fn config(mode: &str) -> SetupConfig {
        SetupConfig::from_yaml_str(&format!(
            r#"
name: smu-test
voltage_range: [-2.0, 1.5]
current_range: [-1.0e-6, 2.0e-6]
min_value: -1.0e-6
max_value: 1.0e-6
data_density: 4
ramp_points: 3
smu:
  device_id: "{DEVICE}"
  drive_mode: {mode}
"#
        ))
        .unwrap()
    }

    fn connect(mode: &str) -> (SourceMeasureUnit, SimulatedSmu) {
        let sim = SimulatedSmu::new(DEVICE, 1.0e6);
        let connector = SimulatedSmuConnector::new().with_device(DEVICE, sim.clone());
        let smu = SourceMeasureUnit::connect(&config(mode), &connector, None).unwrap();
        (smu, sim)
    }

    #[test]
    fn construction_pushes_compliance_before_output() {
        let (smu, sim) = connect("CURRENT_DRIVEN");
        let journal = sim.journal();
        let position = |cmd: &SmuCommand| journal.iter().position(|c| c == cmd).unwrap();

        let compliance = SmuCommand::SetCompliance(smu.compliance());
        assert!(position(&SmuCommand::Reset) < position(&SmuCommand::SelectSource(DriveMode::CurrentDriven)));
        assert!(position(&compliance) < position(&SmuCommand::EnableOutput));
        assert!(position(&SmuCommand::EnableOutput) < position(&SmuCommand::FrontTerminals));
        assert_eq!(smu.compliance().voltage_max, 1.5);
        assert_eq!(smu.compliance().current_max, 1.0e-6);
        assert!(sim.output_enabled());
    }

    #[test]
    fn unknown_device_is_not_found() {
        let connector = SimulatedSmuConnector::new();
        let err = SourceMeasureUnit::connect(&config("CURRENT_DRIVEN"), &connector, None)
            .unwrap_err();
        assert!(matches!(err, DaqError::DeviceNotFound { .. }));
    }

    #[test]
    fn invalid_drive_mode_never_enables_output() {
        let sim = SimulatedSmu::new(DEVICE, 1.0e6);
        let connector = SimulatedSmuConnector::new().with_device(DEVICE, sim.clone());
        let err = SourceMeasureUnit::connect(&config("CURENT_DRIVEN"), &connector, None)
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(!sim.journal().contains(&SmuCommand::EnableOutput));
    }

    #[test]
    fn operator_abort_happens_before_output_is_enabled() {
        let sim = SimulatedSmu::new(DEVICE, 1.0e6);
        let connector = SimulatedSmuConnector::new().with_device(DEVICE, sim.clone());
        let mut gate = MemorySink::default().with_decision(OperatorDecision::Abort);

        let err = SourceMeasureUnit::connect(&config("CURRENT_DRIVEN"), &connector, Some(&mut gate))
            .unwrap_err();
        assert!(matches!(err, DaqError::OperatorAbort));
        assert_eq!(gate.prompts.len(), 1);
        assert!(sim
            .journal()
            .iter()
            .any(|c| matches!(c, SmuCommand::SetCompliance(_))));
        assert!(!sim.journal().contains(&SmuCommand::EnableOutput));
    }

    #[test]
    #[traced_test]
    fn out_of_mode_actuation_warns_once_and_changes_nothing() {
        let (mut smu, sim) = connect("CURRENT_DRIVEN");
        let before = sim.journal().len();

        let outcome = smu.set_voltage(0.5).unwrap();
        assert_eq!(
            outcome,
            Actuation::Ignored {
                attempted: Quantity::Voltage
            }
        );
        assert_eq!(smu.last_commanded_value(), 0.0);
        assert_eq!(sim.journal().len(), before);

        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("Ignoring out-of-mode actuation"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected exactly one warning, saw {n}")),
            }
        });
    }

    #[test]
    fn in_mode_actuation_ramps_and_updates_state() {
        let (mut smu, sim) = connect("CURRENT_DRIVEN");
        assert_eq!(smu.set_current(1.0e-6).unwrap(), Actuation::Applied);
        assert_eq!(smu.last_commanded_value(), 1.0e-6);
        assert_eq!(sim.source_levels(), vec![0.0, 0.5e-6, 1.0e-6]);
        assert!((smu.measure_voltage().unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn setpoint_outside_range_is_rejected() {
        let (mut smu, sim) = connect("VOLTAGE_DRIVEN");
        assert!(matches!(
            smu.set_voltage(3.0),
            Err(DaqError::OutOfBounds { .. })
        ));
        assert!(sim.source_levels().is_empty());
    }

    #[test]
    fn faulted_ramp_keeps_last_confirmed_value() {
        let (mut smu, sim) = connect("VOLTAGE_DRIVEN");
        smu.set_voltage(1.0).unwrap();
        sim.fail_source_at(5);
        assert!(matches!(smu.set_voltage(-1.0), Err(DaqError::Hardware(_))));
        assert_eq!(smu.last_commanded_value(), 1.0);
    }

    #[test]
    fn missing_reading_is_no_measurement() {
        let (mut smu, sim) = connect("VOLTAGE_DRIVEN");
        sim.missing_reading_at(1);
        assert!(matches!(
            smu.measure_current(),
            Err(DaqError::NoMeasurement { .. })
        ));
        assert!(smu.measure_current().is_ok());
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (mut smu, sim) = connect("VOLTAGE_DRIVEN");
        smu.set_voltage(1.0).unwrap();

        smu.shutdown().unwrap();
        let after_first = sim.journal().len();
        assert!(!sim.output_enabled());
        assert_eq!(sim.level(), 0.0);

        smu.shutdown().unwrap();
        assert_eq!(sim.journal().len(), after_first);
        assert!(smu.is_shut_down());
    }

    #[test]
    fn calibration_predicate() {
        assert!(SourceMeasureUnit::is_calibrated(0.001, -1e-9, 0.01, 1e-8));
        assert!(!SourceMeasureUnit::is_calibrated(0.02, 0.0, 0.01, 1e-8));
        assert!(!SourceMeasureUnit::is_calibrated(0.0, 1e-7, 0.01, 1e-8));
    }
}

//! Mock Hardware Implementations
//!
//! Provides simulated devices for running sweeps without physical hardware.
//! Every mock records the commands it receives so tests can assert on the
//! exact hardware traffic, and each supports fault injection.
//!
//! # Available Mocks
//!
//! - `SimulatedSmu` - Ohmic source-measure unit behind [`SmuDriver`]
//! - `SimulatedSmuConnector` - Address book of simulated SMUs behind [`SmuConnector`]
//! - `SimulatedBus` - DAQ chassis bus behind [`AnalogBus`]
//!
//! Mocks are cheap to clone; clones share state, so a test can keep a handle
//! while the device role owns another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{DaqError, DaqResult, HardwareFault};
use crate::hardware::{
    AnalogBus, Bounds, BusResult, ComplianceLimits, DriveMode, InputKind, SmuConnector, SmuDriver,
};

// =============================================================================
// SimulatedSmu - Ohmic Source-Measure Unit
// =============================================================================

/// One command received by a [`SimulatedSmu`].
#[derive(Debug, Clone, PartialEq)]
pub enum SmuCommand {
    /// `*IDN?`
    Identify,
    /// `*RST`
    Reset,
    /// `*CLS`
    Clear,
    /// Source function selection
    SelectSource(DriveMode),
    /// Compliance limits
    SetCompliance(ComplianceLimits),
    /// Output on
    EnableOutput,
    /// Output off
    DisableOutput,
    /// Front terminal routing
    FrontTerminals,
    /// Integration and trigger setup
    Integration {
        /// Power line cycles per sample
        nplc: f64,
        /// Source settle delay
        source_delay: Duration,
        /// Trigger count
        trigger_count: u32,
    },
    /// Current level (A)
    SourceCurrent(f64),
    /// Voltage level (V)
    SourceVoltage(f64),
    /// Voltage query
    ReadVoltage,
    /// Current query
    ReadCurrent,
}

#[derive(Debug)]
struct SmuState {
    device_id: String,
    resistance: f64,
    mode: Option<DriveMode>,
    level: f64,
    output_enabled: bool,
    journal: Vec<SmuCommand>,
    reads: usize,
    sources: usize,
    missing_reads: HashSet<usize>,
    failing_sources: HashSet<usize>,
    fail_front_terminals: bool,
    fail_integration: bool,
}

/// Simulated SMU with a resistive load.
///
/// When sourcing current `I` it reads back `I * R`; when sourcing voltage `V`
/// it reads back `V / R`. With output disabled every reading is zero.
#[derive(Debug, Clone)]
pub struct SimulatedSmu {
    state: Arc<Mutex<SmuState>>,
}

impl SimulatedSmu {
    /// Create a simulated SMU at `device_id` with a load of `resistance` ohms.
    pub fn new(device_id: impl Into<String>, resistance: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SmuState {
                device_id: device_id.into(),
                resistance,
                mode: None,
                level: 0.0,
                output_enabled: false,
                journal: Vec::new(),
                reads: 0,
                sources: 0,
                missing_reads: HashSet::new(),
                failing_sources: HashSet::new(),
                fail_front_terminals: false,
                fail_integration: false,
            })),
        }
    }

    /// The `n`th reading (1-based, counting both quantities) returns no data.
    pub fn missing_reading_at(&self, n: usize) {
        self.state.lock().missing_reads.insert(n);
    }

    /// The `n`th source-level command (1-based) faults on the bus.
    pub fn fail_source_at(&self, n: usize) {
        self.state.lock().failing_sources.insert(n);
    }

    /// Front terminal routing faults on the bus.
    pub fn fail_front_terminals(&self) {
        self.state.lock().fail_front_terminals = true;
    }

    /// Integration and trigger setup faults on the bus.
    pub fn fail_integration(&self) {
        self.state.lock().fail_integration = true;
    }

    /// Every command received so far, in order.
    pub fn journal(&self) -> Vec<SmuCommand> {
        self.state.lock().journal.clone()
    }

    /// Source-level commands received so far.
    pub fn source_levels(&self) -> Vec<f64> {
        self.state
            .lock()
            .journal
            .iter()
            .filter_map(|cmd| match cmd {
                SmuCommand::SourceCurrent(v) | SmuCommand::SourceVoltage(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Whether the output terminals are energized.
    pub fn output_enabled(&self) -> bool {
        self.state.lock().output_enabled
    }

    /// Currently sourced level.
    pub fn level(&self) -> f64 {
        self.state.lock().level
    }

    fn source(&mut self, mode: DriveMode, value: f64) -> BusResult<()> {
        let mut state = self.state.lock();
        state.journal.push(match mode {
            DriveMode::CurrentDriven => SmuCommand::SourceCurrent(value),
            DriveMode::VoltageDriven => SmuCommand::SourceVoltage(value),
        });
        state.sources += 1;
        if state.failing_sources.contains(&state.sources) {
            return Err(HardwareFault::new(
                state.device_id.clone(),
                "simulated bus fault while sourcing",
            ));
        }
        if state.mode != Some(mode) {
            return Err(HardwareFault::new(
                state.device_id.clone(),
                format!("source function is not {mode}"),
            ));
        }
        state.level = value;
        Ok(())
    }

    fn read(&mut self, quantity: InputKind) -> BusResult<Option<f64>> {
        let mut state = self.state.lock();
        state.journal.push(match quantity {
            InputKind::Voltage => SmuCommand::ReadVoltage,
            InputKind::Current => SmuCommand::ReadCurrent,
        });
        state.reads += 1;
        if state.missing_reads.contains(&state.reads) {
            return Ok(None);
        }
        if !state.output_enabled {
            return Ok(Some(0.0));
        }
        let value = match (state.mode, quantity) {
            (Some(DriveMode::CurrentDriven), InputKind::Voltage) => state.level * state.resistance,
            (Some(DriveMode::VoltageDriven), InputKind::Current) => state.level / state.resistance,
            (Some(DriveMode::CurrentDriven), InputKind::Current)
            | (Some(DriveMode::VoltageDriven), InputKind::Voltage) => state.level,
            (None, _) => 0.0,
        };
        Ok(Some(value))
    }

    fn record(&mut self, command: SmuCommand) {
        self.state.lock().journal.push(command);
    }
}

impl SmuDriver for SimulatedSmu {
    fn identify(&mut self) -> BusResult<String> {
        self.record(SmuCommand::Identify);
        Ok("SIMULATED,MODEL 2400,0,C00".to_string())
    }

    fn reset(&mut self) -> BusResult<()> {
        self.record(SmuCommand::Reset);
        let mut state = self.state.lock();
        state.mode = None;
        state.level = 0.0;
        state.output_enabled = false;
        Ok(())
    }

    fn clear(&mut self) -> BusResult<()> {
        self.record(SmuCommand::Clear);
        Ok(())
    }

    fn select_source(&mut self, mode: DriveMode) -> BusResult<()> {
        self.record(SmuCommand::SelectSource(mode));
        self.state.lock().mode = Some(mode);
        Ok(())
    }

    fn set_compliance(&mut self, limits: ComplianceLimits) -> BusResult<()> {
        self.record(SmuCommand::SetCompliance(limits));
        Ok(())
    }

    fn enable_output(&mut self) -> BusResult<()> {
        self.record(SmuCommand::EnableOutput);
        self.state.lock().output_enabled = true;
        Ok(())
    }

    fn disable_output(&mut self) -> BusResult<()> {
        self.record(SmuCommand::DisableOutput);
        self.state.lock().output_enabled = false;
        Ok(())
    }

    fn use_front_terminals(&mut self) -> BusResult<()> {
        self.record(SmuCommand::FrontTerminals);
        let state = self.state.lock();
        if state.fail_front_terminals {
            return Err(HardwareFault::new(
                state.device_id.clone(),
                "simulated bus fault routing terminals",
            ));
        }
        Ok(())
    }

    fn configure_integration(
        &mut self,
        nplc: f64,
        source_delay: Duration,
        trigger_count: u32,
    ) -> BusResult<()> {
        self.record(SmuCommand::Integration {
            nplc,
            source_delay,
            trigger_count,
        });
        let state = self.state.lock();
        if state.fail_integration {
            return Err(HardwareFault::new(
                state.device_id.clone(),
                "simulated bus fault configuring integration",
            ));
        }
        Ok(())
    }

    fn source_current(&mut self, amps: f64) -> BusResult<()> {
        self.source(DriveMode::CurrentDriven, amps)
    }

    fn source_voltage(&mut self, volts: f64) -> BusResult<()> {
        self.source(DriveMode::VoltageDriven, volts)
    }

    fn read_voltage(&mut self) -> BusResult<Option<f64>> {
        self.read(InputKind::Voltage)
    }

    fn read_current(&mut self) -> BusResult<Option<f64>> {
        self.read(InputKind::Current)
    }
}

/// Hands out registered [`SimulatedSmu`]s by device id.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSmuConnector {
    devices: HashMap<String, SimulatedSmu>,
}

impl SimulatedSmuConnector {
    /// Empty address book: every connection fails with `DeviceNotFound`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `smu` under `device_id`.
    pub fn with_device(mut self, device_id: impl Into<String>, smu: SimulatedSmu) -> Self {
        self.devices.insert(device_id.into(), smu);
        self
    }
}

impl SmuConnector for SimulatedSmuConnector {
    fn connect(&self, device_id: &str, _timeout: Duration) -> DaqResult<Box<dyn SmuDriver>> {
        self.devices
            .get(device_id)
            .map(|smu| Box::new(smu.clone()) as Box<dyn SmuDriver>)
            .ok_or_else(|| DaqError::DeviceNotFound {
                device: format!("SMU {device_id}"),
            })
    }
}

// =============================================================================
// SimulatedBus - DAQ Chassis Bus
// =============================================================================

/// One output write received by a [`SimulatedBus`].
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Physical line
    pub line: String,
    /// Samples in the burst (one for a single-step write)
    pub samples: Vec<f64>,
    /// Requested update rate (Hz)
    pub update_rate: f64,
}

#[derive(Debug, Default)]
struct BusState {
    modules: Vec<String>,
    resets: Vec<String>,
    writes: Vec<WriteRecord>,
    inputs: HashMap<String, Vec<f64>>,
    reads: usize,
    empty_reads: HashSet<usize>,
    failing_lines: HashSet<String>,
    commands: usize,
}

/// Simulated chassis with named modules.
///
/// Inputs return a configured sample pattern (zeros by default), repeated
/// or truncated to the requested count. Outputs are journaled.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    /// Create a bus with the given modules attached.
    pub fn new<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bus = Self::default();
        bus.state.lock().modules = modules.into_iter().map(Into::into).collect();
        bus
    }

    /// Every acquisition on `line` returns a constant `value`.
    pub fn set_input_level(&self, line: &str, value: f64) {
        self.set_input_samples(line, vec![value]);
    }

    /// Acquisitions on `line` cycle through `samples`.
    pub fn set_input_samples(&self, line: &str, samples: Vec<f64>) {
        self.state.lock().inputs.insert(line.to_string(), samples);
    }

    /// Writes and reads on `line` fault until [`clear_faults`](Self::clear_faults).
    pub fn fail_writes_on(&self, line: &str) {
        self.state.lock().failing_lines.insert(line.to_string());
    }

    /// Remove all injected line faults.
    pub fn clear_faults(&self) {
        self.state.lock().failing_lines.clear();
    }

    /// The `n`th acquisition (1-based, all lines) returns no samples.
    pub fn empty_read_at(&self, n: usize) {
        self.state.lock().empty_reads.insert(n);
    }

    /// All output writes so far, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    /// Output writes to a single line.
    pub fn writes_to(&self, line: &str) -> Vec<WriteRecord> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.line == line)
            .cloned()
            .collect()
    }

    /// Modules that have been reset.
    pub fn resets(&self) -> Vec<String> {
        self.state.lock().resets.clone()
    }

    /// Total number of bus transactions of any kind.
    pub fn commands_issued(&self) -> usize {
        self.state.lock().commands
    }
}

impl AnalogBus for SimulatedBus {
    fn module_names(&self) -> BusResult<Vec<String>> {
        let mut state = self.state.lock();
        state.commands += 1;
        Ok(state.modules.clone())
    }

    fn reset_module(&self, module: &str) -> BusResult<()> {
        let mut state = self.state.lock();
        state.commands += 1;
        if !state.modules.iter().any(|m| m == module) {
            return Err(HardwareFault::new(module, "no such module"));
        }
        state.resets.push(module.to_string());
        Ok(())
    }

    fn write(&self, line: &str, _bounds: Bounds, samples: &[f64], update_rate: f64) -> BusResult<()> {
        let mut state = self.state.lock();
        state.commands += 1;
        if state.failing_lines.contains(line) {
            return Err(HardwareFault::new(line, "simulated write fault"));
        }
        state.writes.push(WriteRecord {
            line: line.to_string(),
            samples: samples.to_vec(),
            update_rate,
        });
        Ok(())
    }

    fn read(&self, line: &str, _kind: InputKind, count: usize, _rate: f64) -> BusResult<Vec<f64>> {
        let mut state = self.state.lock();
        state.commands += 1;
        state.reads += 1;
        if state.failing_lines.contains(line) {
            return Err(HardwareFault::new(line, "simulated read fault"));
        }
        if state.empty_reads.contains(&state.reads) {
            return Ok(Vec::new());
        }
        let pattern = state.inputs.get(line).cloned().unwrap_or_else(|| vec![0.0]);
        Ok(pattern.iter().copied().cycle().take(count).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ohmic_smu_reads_back_through_load() {
        let mut smu = SimulatedSmu::new("GPIB0::15::INSTR", 1000.0);
        smu.select_source(DriveMode::VoltageDriven).unwrap();
        smu.enable_output().unwrap();
        smu.source_voltage(2.0).unwrap();
        assert_eq!(smu.read_current().unwrap(), Some(0.002));
    }

    #[test]
    fn smu_rejects_source_outside_selected_function() {
        let mut smu = SimulatedSmu::new("GPIB0::15::INSTR", 1000.0);
        smu.select_source(DriveMode::CurrentDriven).unwrap();
        assert!(smu.source_voltage(1.0).is_err());
    }

    #[test]
    fn smu_injected_missing_reading() {
        let mut smu = SimulatedSmu::new("GPIB0::15::INSTR", 1000.0);
        smu.missing_reading_at(2);
        assert!(smu.read_voltage().unwrap().is_some());
        assert!(smu.read_voltage().unwrap().is_none());
        assert!(smu.read_voltage().unwrap().is_some());
    }

    #[test]
    fn connector_reports_unknown_address() {
        let connector = SimulatedSmuConnector::new()
            .with_device("GPIB0::15::INSTR", SimulatedSmu::new("GPIB0::15::INSTR", 1.0));
        assert!(connector
            .connect("GPIB0::15::INSTR", Duration::from_secs(1))
            .is_ok());
        assert!(matches!(
            connector.connect("GPIB0::16::INSTR", Duration::from_secs(1)),
            Err(DaqError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn bus_repeats_sample_pattern() {
        let bus = SimulatedBus::new(["cDAQ1Mod2"]);
        bus.set_input_samples("cDAQ1Mod2/ai0", vec![1.0, 2.0]);
        let samples = bus
            .read("cDAQ1Mod2/ai0", InputKind::Voltage, 5, 1000.0)
            .unwrap();
        assert_eq!(samples, vec![1.0, 2.0, 1.0, 2.0, 1.0]);
        assert_eq!(bus.commands_issued(), 1);
    }

    #[test]
    fn bus_reset_of_unknown_module_faults() {
        let bus = SimulatedBus::new(["cDAQ1Mod1"]);
        assert!(bus.reset_module("cDAQ1Mod1").is_ok());
        assert!(bus.reset_module("cDAQ1Mod9").is_err());
        assert_eq!(bus.resets(), vec!["cDAQ1Mod1".to_string()]);
    }
}

//! Integration tests for DAQ chassis construction and shutdown safety.

use std::sync::Arc;

use rnpu_sweep::config::SetupConfig;
use rnpu_sweep::error::DaqError;
use rnpu_sweep::hardware::mock::SimulatedBus;
use rnpu_sweep::hardware::DaqChassis;

const ACTIVATION: &str = "cDAQ1Mod3";
const READOUT: &str = "cDAQ1Mod4";

fn config(voltage_range: &str) -> SetupConfig {
    SetupConfig::from_yaml_str(&format!(
        r#"
name: chassis-safety
voltage_range: {voltage_range}
current_range: [-1.0e-6, 1.0e-6]
min_value: -0.5
max_value: 0.5
data_density: 4
ramp_points: 5
amplification: 100.0
daq:
  activation_module_id: {ACTIVATION}
  readout_module_id: {READOUT}
  sample_frequency: 2000
  update_frequency: 1000
  samples_per_measurement: 4
  control_voltages:
    1: 0.4
    2: -0.8
  readout_channels: [0, 5]
"#
    ))
    .expect("Failed to parse test config")
}

fn last_sample(bus: &SimulatedBus, line: &str) -> Option<f64> {
    bus.writes_to(line)
        .last()
        .and_then(|w| w.samples.last().copied())
}

#[test]
fn test_construction_only_writes_zero() {
    let bus = SimulatedBus::new([ACTIVATION, READOUT]);
    let chassis = DaqChassis::new(&config("[-1.0, 1.0]"), Arc::new(bus.clone())).unwrap();

    assert_eq!(bus.resets(), vec![ACTIVATION, READOUT]);
    assert_eq!(chassis.activation_ids(), vec![1, 2]);
    assert_eq!(chassis.readout_ids(), vec![0, 5]);
    for line in ["cDAQ1Mod3/ao1", "cDAQ1Mod3/ao2"] {
        let writes = bus.writes_to(line);
        assert_eq!(writes.len(), 1, "{line}");
        assert!(writes[0].samples.iter().all(|v| *v == 0.0));
        assert_eq!(writes[0].update_rate, 1000.0);
    }
}

#[test]
fn test_range_without_zero_is_rejected_before_any_command() {
    let bus = SimulatedBus::new([ACTIVATION, READOUT]);
    let result = DaqChassis::new(&config("[0.1, 1.0]"), Arc::new(bus.clone()));

    assert!(matches!(result, Err(DaqError::Configuration(_))));
    assert_eq!(bus.commands_issued(), 0);
}

#[test]
fn test_missing_module_is_not_found() {
    let bus = SimulatedBus::new([ACTIVATION]);
    let result = DaqChassis::new(&config("[-1.0, 1.0]"), Arc::new(bus.clone()));

    assert!(matches!(result, Err(DaqError::DeviceNotFound { .. })));
    assert!(bus.writes().is_empty());
}

#[test]
fn test_activation_reaches_control_voltages() {
    let bus = SimulatedBus::new([ACTIVATION, READOUT]);
    let mut chassis = DaqChassis::new(&config("[-1.0, 1.0]"), Arc::new(bus.clone())).unwrap();

    chassis.start_active_all_channels().unwrap();

    assert_eq!(last_sample(&bus, "cDAQ1Mod3/ao1"), Some(0.4));
    assert_eq!(last_sample(&bus, "cDAQ1Mod3/ao2"), Some(-0.8));
    let ramp = &bus.writes_to("cDAQ1Mod3/ao2")[1];
    assert_eq!(ramp.samples.len(), 5);
    assert_eq!(ramp.samples[0], 0.0);
}

#[test]
fn test_readout_current_is_amplification_corrected() {
    let bus = SimulatedBus::new([ACTIVATION, READOUT]);
    bus.set_input_samples("cDAQ1Mod4/ai5", vec![1.0, 3.0]);
    let chassis = DaqChassis::new(&config("[-1.0, 1.0]"), Arc::new(bus.clone())).unwrap();

    let amps = chassis.measure_current(5).unwrap();
    assert!((amps - 0.02).abs() < 1e-12);

    let volts = chassis.measure_voltage_all_channels().unwrap();
    assert_eq!(volts.get(&0), Some(&0.0));
    assert_eq!(volts.get(&5), Some(&2.0));

    assert!(matches!(
        chassis.measure_current(3),
        Err(DaqError::InvalidChannel { .. })
    ));
}

#[test]
fn test_shutdown_attempts_every_channel() {
    let bus = SimulatedBus::new([ACTIVATION, READOUT]);
    let mut chassis = DaqChassis::new(&config("[-1.0, 1.0]"), Arc::new(bus.clone())).unwrap();
    chassis.start_active_all_channels().unwrap();

    bus.fail_writes_on("cDAQ1Mod3/ao1");
    let result = chassis.shutdown();

    match result {
        Err(DaqError::ShutdownFailed(errors)) => assert_eq!(errors.len(), 1),
        other => panic!("expected ShutdownFailed, got {other:?}"),
    }
    assert_eq!(last_sample(&bus, "cDAQ1Mod3/ao2"), Some(0.0));
    assert!(chassis.is_shut_down());
}

#[test]
fn test_shutdown_is_idempotent() {
    let bus = SimulatedBus::new([ACTIVATION, READOUT]);
    let mut chassis = DaqChassis::new(&config("[-1.0, 1.0]"), Arc::new(bus.clone())).unwrap();
    chassis.start_active_all_channels().unwrap();

    chassis.shutdown().unwrap();
    assert_eq!(last_sample(&bus, "cDAQ1Mod3/ao1"), Some(0.0));
    assert_eq!(last_sample(&bus, "cDAQ1Mod3/ao2"), Some(0.0));

    let issued = bus.commands_issued();
    chassis.shutdown().unwrap();
    assert_eq!(bus.commands_issued(), issued);
}

#[test]
fn test_single_point_ramp_reaches_target_and_returns_to_zero() {
    let bus = SimulatedBus::new([ACTIVATION, READOUT]);
    let mut config = config("[-1.0, 1.0]");
    config.ramp_points = 1;
    let mut chassis = DaqChassis::new(&config, Arc::new(bus.clone())).unwrap();

    chassis.start_active_all_channels().unwrap();
    assert_eq!(last_sample(&bus, "cDAQ1Mod3/ao1"), Some(0.4));
    assert_eq!(last_sample(&bus, "cDAQ1Mod3/ao2"), Some(-0.8));

    chassis.shutdown().unwrap();
    let bursts: Vec<Vec<f64>> = bus
        .writes_to("cDAQ1Mod3/ao1")
        .into_iter()
        .map(|w| w.samples)
        .collect();
    assert_eq!(bursts.last(), Some(&vec![0.0]));
    assert_eq!(last_sample(&bus, "cDAQ1Mod3/ao2"), Some(0.0));
}

//! Integration tests for the filesystem run folder sink.

use std::fs;
use std::io::{self, Cursor};
use std::sync::Arc;

use rnpu_sweep::config::SetupConfig;
use rnpu_sweep::experiment::ExperimentController;
use rnpu_sweep::hardware::mock::{SimulatedBus, SimulatedSmuConnector};
use rnpu_sweep::hardware::ChannelReadings;
use rnpu_sweep::sink::{ExperimentSink, OperatorDecision, OperatorGate, RunFolder};
use rnpu_sweep::waveform::{self, Waveform, WaveformKind};
use rnpu_sweep::Context;
use tempfile::TempDir;

fn config() -> SetupConfig {
    SetupConfig::from_yaml_str(
        r#"
name: folder-test
voltage_range: [-1.0, 1.0]
current_range: [-1.0e-6, 1.0e-6]
min_value: -0.6
max_value: 0.6
data_density: 3
ramp_points: 2
waveform: sawtooth
amplification: 4.0
daq:
  activation_module_id: cDAQ1Mod1
  readout_module_id: cDAQ1Mod2
  sample_frequency: 1000
  update_frequency: 1000
  samples_per_measurement: 1
  control_voltages:
    4: 0.0
  readout_channels: [7]
experiment:
  strategy: chassis_only
  activation_channel: 4
  readout_channel: 7
"#,
    )
    .expect("Failed to parse test config")
}

fn folder(dir: &TempDir, input: &Waveform) -> RunFolder {
    RunFolder::create_at(dir.path().join("run"), &config(), input)
        .unwrap()
        .with_prompt_output(io::sink())
}

#[test]
fn test_creation_writes_meta_and_input() {
    let dir = TempDir::new().unwrap();
    let input = waveform::generate(&config().waveform_spec()).unwrap();
    let folder = folder(&dir, &input);

    let meta = fs::read_to_string(folder.path().join("setup.META")).unwrap();
    assert!(meta.contains("name: folder-test"));

    let read_back = folder.get_input_data().unwrap();
    assert_eq!(read_back, input.as_slice());

    folder.close(true).unwrap();
    let meta = fs::read_to_string(dir.path().join("run/setup.META")).unwrap();
    assert!(meta.trim_end().ends_with("terminated_normally: true"));
}

#[test]
fn test_timestamped_folder_uses_setup_name() {
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.output_dir = dir.path().to_path_buf();
    let input = Waveform::from_values(vec![0.0]);

    let folder = RunFolder::create(&config, &input).unwrap();
    let name = folder
        .path()
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap()
        .to_string();
    assert!(name.starts_with("folder-test-"));
    assert_eq!(folder.log_path(), folder.path().join("setup.LOG"));
    folder.close(false).unwrap();
}

#[test]
fn test_gate_repeats_until_answered() {
    let dir = TempDir::new().unwrap();
    let mut folder = folder(&dir, &Waveform::from_values(vec![0.0]))
        .with_operator_input(Cursor::new("maybe\n\nY\nn\n"));

    assert_eq!(
        folder.wait_for_user_input("Enable?").unwrap(),
        OperatorDecision::Continue
    );
    assert_eq!(
        folder.wait_for_user_input("Enable?").unwrap(),
        OperatorDecision::Abort
    );
    // Closed input counts as a refusal.
    assert_eq!(
        folder.wait_for_user_input("Enable?").unwrap(),
        OperatorDecision::Abort
    );
    folder.close(true).unwrap();
}

#[test]
fn test_channel_csv_has_headers_and_nan_gaps() {
    let dir = TempDir::new().unwrap();
    let mut folder = folder(&dir, &Waveform::from_values(vec![0.1, 0.2]));

    let rows: Vec<ChannelReadings> = vec![
        [(0, 1.5), (2, -0.5)].into_iter().collect(),
        [(0, f64::NAN), (2, f64::NAN)].into_iter().collect(),
    ];
    folder.write_voltage(&rows).unwrap();
    folder.write_source_readback(&[(0.1, 0.25)]).unwrap();

    let voltage = fs::read_to_string(folder.path().join("output_voltage.csv")).unwrap();
    let lines: Vec<&str> = voltage.lines().collect();
    assert_eq!(lines, vec!["Channel 0,Channel 2", "1.5,-0.5", "NaN,NaN"]);

    let readback = fs::read_to_string(folder.path().join("source_readback.csv")).unwrap();
    assert_eq!(readback.lines().collect::<Vec<_>>(), vec!["setpoint,readback", "0.1,0.25"]);
    folder.close(true).unwrap();
}

#[test]
fn test_chassis_only_run_into_folder() {
    let dir = TempDir::new().unwrap();
    let ctx = Context::new(config()).unwrap();
    assert_eq!(ctx.config().waveform, WaveformKind::Sawtooth);

    let input = waveform::generate(&ctx.config().waveform_spec()).unwrap();
    let mut folder = folder(&dir, &input);

    let bus = SimulatedBus::new(["cDAQ1Mod1", "cDAQ1Mod2"]);
    bus.set_input_level("cDAQ1Mod2/ai7", 2.0);
    let mut controller = ExperimentController::connect(
        &ctx,
        &SimulatedSmuConnector::new(),
        Arc::new(bus),
        Some(&mut folder as &mut dyn OperatorGate),
    )
    .unwrap();

    let setpoints = folder.get_input_data().unwrap();
    let run = controller.run(&setpoints, &mut folder).unwrap();
    assert_eq!(run.len(), 9);
    folder.close(true).unwrap();

    let matrix = fs::read_to_string(dir.path().join("run/output_current.csv")).unwrap();
    let rows: Vec<Vec<f64>> = matrix
        .lines()
        .map(|line| line.split(',').map(|v| v.parse().unwrap()).collect())
        .collect();
    assert_eq!(rows.len(), 9);
    for (row, sp) in rows.iter().zip(input.iter()) {
        assert_eq!(row.len(), 2);
        assert_eq!(row[0], sp);
        assert_eq!(row[1], 0.5);
    }
}

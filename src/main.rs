//! CLI Entry Point for rnpu-sweep
//!
//! Provides command-line interface for:
//! - Running a configured sweep against real or simulated hardware
//! - Printing a generated waveform as CSV
//!
//! # Usage
//!
//! Run a sweep:
//! ```bash
//! rnpu-sweep run --config config/setup.example.yaml --simulate
//! ```
//!
//! Inspect a waveform:
//! ```bash
//! rnpu-sweep waveform --kind sawtooth --min -1 --max 1 --points 5
//! ```
//!
//! The sweep itself is blocking and runs on a dedicated blocking task; the
//! async runtime only watches for Ctrl-C, which requests a stop between steps.
//!
//! No DAQ chassis driver ships with the binary. Setups with a `daq` section
//! run only with `--simulate`; without it they are rejected before any run
//! folder is created or device is opened.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use rnpu_sweep::config::SetupConfig;
use rnpu_sweep::error::{DaqError, DaqResult};
use rnpu_sweep::experiment::{ExperimentController, ExperimentRun};
use rnpu_sweep::hardware::mock::{SimulatedBus, SimulatedSmu, SimulatedSmuConnector};
use rnpu_sweep::hardware::scpi;
use rnpu_sweep::hardware::{AnalogBus, SmuConnector};
use rnpu_sweep::logging::{self, OutputFormat, TracingConfig};
use rnpu_sweep::sink::{ExperimentSink, OperatorGate, RunFolder};
use rnpu_sweep::waveform::{self, WaveformKind, WaveformSpec};
use rnpu_sweep::Context;

#[derive(Parser)]
#[command(name = "rnpu-sweep")]
#[command(about = "SMU and DAQ chassis characterization sweeps", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sweep described by a setup file
    Run {
        /// Path to the setup file (.yaml, .yml or .toml)
        #[arg(long)]
        config: PathBuf,

        /// Use simulated devices instead of hardware
        #[arg(long)]
        simulate: bool,

        /// Console log format: pretty, compact or json
        #[arg(long, default_value = "compact")]
        log_format: String,
    },

    /// Print a generated waveform as comma separated values
    Waveform {
        /// sawtooth, linear or multi_phase
        #[arg(long, default_value = "multi_phase")]
        kind: String,

        /// Lowest excursion
        #[arg(long, allow_negative_numbers = true)]
        min: f64,

        /// Highest excursion
        #[arg(long, allow_negative_numbers = true)]
        max: f64,

        /// Points per single-length segment
        #[arg(long)]
        points: usize,

        /// Clamp every value to [LO, HI]
        #[arg(long, num_args = 2, value_names = ["LO", "HI"], allow_negative_numbers = true)]
        clamp: Option<Vec<f64>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            log_format,
        } => run_sweep(config, simulate, &log_format).await,
        Commands::Waveform {
            kind,
            min,
            max,
            points,
            clamp,
        } => print_waveform(&kind, min, max, points, clamp),
    }
}

async fn run_sweep(config_path: PathBuf, simulate: bool, log_format: &str) -> Result<()> {
    let config = SetupConfig::load_from(&config_path)
        .with_context(|| format!("Failed to load setup {}", config_path.display()))?;
    let ctx = Context::new(config)?;
    let (connector, bus) = devices(ctx.config(), simulate)?;

    let setpoints = waveform::generate(&ctx.config().waveform_spec())?;
    let folder = RunFolder::create(ctx.config(), &setpoints)?;

    logging::init(
        TracingConfig::from_setup(ctx.config())?
            .with_format(log_format.parse::<OutputFormat>()?)
            .with_log_file(folder.log_path()),
    )?;
    info!(
        setup = %ctx.config().name,
        folder = %folder.path().display(),
        setpoints = setpoints.len(),
        simulate,
        "Run prepared"
    );

    let interrupt = ctx.interrupt().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.trigger("Ctrl-C");
        }
    });

    let (folder, outcome) =
        tokio::task::spawn_blocking(move || execute_sweep(&ctx, connector, bus, folder)).await?;

    let terminated_normally = outcome.is_ok();
    folder.close(terminated_normally)?;

    match outcome {
        Ok(run) => {
            info!(
                complete = run.complete_count(),
                gaps = run.len() - run.complete_count(),
                "Run complete"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "Run failed");
            Err(err.into())
        }
    }
}

type Devices = (Box<dyn SmuConnector + Send>, Arc<dyn AnalogBus>);

fn execute_sweep(
    ctx: &Context,
    connector: Box<dyn SmuConnector + Send>,
    bus: Arc<dyn AnalogBus>,
    mut folder: RunFolder,
) -> (RunFolder, DaqResult<ExperimentRun>) {
    let outcome = (|| {
        let mut controller = ExperimentController::connect(
            ctx,
            connector.as_ref(),
            bus,
            Some(&mut folder as &mut dyn OperatorGate),
        )?;
        let setpoints = folder.get_input_data()?;
        controller.run(&setpoints, &mut folder)
    })();
    (folder, outcome)
}

/// Connector and bus for the run; rejects chassis setups on real hardware.
fn devices(config: &SetupConfig, simulate: bool) -> DaqResult<Devices> {
    if simulate {
        return Ok(simulated_devices(config));
    }

    if let Some(daq) = &config.daq {
        return Err(DaqError::Configuration(format!(
            "No DAQ chassis driver is built into rnpu-sweep, so modules {} and {} cannot be \
             opened; rerun with --simulate",
            daq.activation_module_id, daq.readout_module_id
        )));
    }

    let connector: Box<dyn SmuConnector + Send> = match &config.smu {
        Some(smu) => scpi::connector_for(&smu.device_id, smu.baud_rate),
        None => Box::new(SimulatedSmuConnector::new()),
    };
    // Without a 'daq' section the bus is never opened.
    Ok((connector, Arc::new(SimulatedBus::default())))
}

fn simulated_devices(config: &SetupConfig) -> Devices {
    let mut connector = SimulatedSmuConnector::new();
    if let Some(smu) = &config.smu {
        connector = connector.with_device(&smu.device_id, SimulatedSmu::new(&smu.device_id, 1.0e6));
    }

    let bus = match &config.daq {
        Some(daq) => {
            let bus = SimulatedBus::new([&daq.activation_module_id, &daq.readout_module_id]);
            for id in &daq.readout_channels {
                bus.set_input_level(&format!("{}/ai{id}", daq.readout_module_id), 1.0e-3);
            }
            bus
        }
        None => SimulatedBus::default(),
    };
    (Box::new(connector), Arc::new(bus))
}

fn print_waveform(
    kind: &str,
    min: f64,
    max: f64,
    points: usize,
    clamp: Option<Vec<f64>>,
) -> Result<()> {
    logging::init(TracingConfig::default())?;

    let kind: WaveformKind = kind.parse()?;
    let mut generated = waveform::generate(&WaveformSpec::new(kind, min, max, points))?;
    if let Some(bounds) = clamp {
        if let [lo, hi] = bounds[..] {
            generated = generated.clamp(lo, hi)?;
        }
    }

    println!("{generated}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETUP: &str = r#"
name: cli-test
voltage_range: [-1.0, 1.0]
current_range: [-1.0e-6, 1.0e-6]
min_value: -5.0e-7
max_value: 5.0e-7
data_density: 2
ramp_points: 2
smu:
  device_id: "GPIB0::15::INSTR"
  drive_mode: CURRENT_DRIVEN
daq:
  activation_module_id: cDAQ1Mod1
  readout_module_id: cDAQ1Mod2
  sample_frequency: 1000
  update_frequency: 1000
  samples_per_measurement: 1
  readout_channels: [0]
"#;

    #[test]
    fn chassis_setup_needs_simulation() {
        let config = SetupConfig::from_yaml_str(SETUP).unwrap();

        match devices(&config, false) {
            Err(DaqError::Configuration(message)) => assert!(message.contains("--simulate")),
            Err(other) => panic!("expected Configuration, got {other:?}"),
            Ok(_) => panic!("chassis setup accepted without a chassis driver"),
        }
    }

    #[test]
    fn simulated_chassis_lists_configured_modules() {
        let config = SetupConfig::from_yaml_str(SETUP).unwrap();

        let (_, bus) = devices(&config, true).unwrap();
        assert_eq!(bus.module_names().unwrap(), vec!["cDAQ1Mod1", "cDAQ1Mod2"]);
    }
}

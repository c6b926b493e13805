//! Setup configuration using Figment
//!
//! A setup file describes one characterization run: the sweep, the
//! source-measure unit, the DAQ chassis and the strategy tying them together.
//! Configuration is loaded from:
//! 1. a YAML (`.yaml`/`.yml`) or TOML (`.toml`) setup file
//! 2. environment variables prefixed with `RNPU_`, nested keys split on `__`
//!    (e.g. `RNPU_SMU__DEVICE_ID=GPIB0::16::INSTR`)
//!
//! # Example
//! ```no_run
//! use rnpu_sweep::config::SetupConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SetupConfig::load_from("config/setup.example.yaml")?;
//! config.validate()?;
//! println!("Setup: {}", config.name);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DaqError, DaqResult};
use crate::hardware::{ChannelId, DriveMode};
use crate::waveform::{WaveformKind, WaveformSpec};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RNPU_";

/// Top-level setup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Setup name, used as the run folder prefix
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory the run folder is created in
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Permitted voltage range `[min, max]` (V)
    pub voltage_range: [f64; 2],
    /// Permitted current range `[min, max]` (A)
    pub current_range: [f64; 2],
    /// Lowest sweep excursion
    pub min_value: f64,
    /// Highest sweep excursion
    pub max_value: f64,
    /// Points per single-length waveform segment
    pub data_density: usize,
    /// Points in every ramp; 1 steps straight to the target
    pub ramp_points: usize,
    /// Waveform shape generated from `min_value`/`max_value`
    #[serde(default)]
    pub waveform: WaveformKind,
    /// Gain the readout current is divided by
    #[serde(default = "default_amplification")]
    pub amplification: f64,
    /// Source-measure unit, if the setup uses one
    #[serde(default)]
    pub smu: Option<SmuConfig>,
    /// DAQ chassis, if the setup uses one
    #[serde(default)]
    pub daq: Option<DaqConfig>,
    /// Sweep strategy selection
    #[serde(default)]
    pub experiment: ExperimentConfig,
}

/// Source-measure unit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmuConfig {
    /// Instrument address, passed to the connector unmodified
    pub device_id: String,
    /// Connection timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// `CURRENT_DRIVEN` or `VOLTAGE_DRIVEN`
    pub drive_mode: String,
    /// Pause after every ramp point, in seconds
    #[serde(default)]
    pub pause_between_set: f64,
    /// Block for operator confirmation before output is enabled
    #[serde(default = "default_true")]
    pub confirm_before_output: bool,
    /// Baud rate for serial connections
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl SmuConfig {
    /// Connection timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Pause after every ramp point.
    pub fn pause_between_set(&self) -> Duration {
        Duration::from_secs_f64(self.pause_between_set.max(0.0))
    }

    /// Parsed drive mode.
    pub fn drive_mode(&self) -> DaqResult<DriveMode> {
        self.drive_mode.parse()
    }
}

/// DAQ chassis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Module carrying the activation (analog output) lines
    pub activation_module_id: String,
    /// Module carrying the readout (analog input) lines
    pub readout_module_id: String,
    /// Acquisition sample rate (Hz)
    pub sample_frequency: f64,
    /// Output update rate (Hz)
    pub update_frequency: f64,
    /// Samples averaged into one reading
    pub samples_per_measurement: usize,
    /// Static target voltage for each activation channel
    #[serde(default, deserialize_with = "deserialize_channel_map")]
    pub control_voltages: BTreeMap<ChannelId, f64>,
    /// Readout channel ids
    #[serde(default)]
    pub readout_channels: Vec<ChannelId>,
}

/// Which sweep a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Source current on the SMU, read SMU voltage and every chassis readout
    #[default]
    CurrentSweep,
    /// Source voltage on the SMU, read SMU current and one chassis readout
    VoltageSweep,
    /// Drive one activation channel, read one readout channel
    ChassisOnly,
}

/// Sweep strategy selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Strategy kind
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Activation channel swept by `chassis_only`
    #[serde(default)]
    pub activation_channel: Option<ChannelId>,
    /// Readout channel sampled by `voltage_sweep` and `chassis_only`
    #[serde(default)]
    pub readout_channel: Option<ChannelId>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_amplification() -> f64 {
    1.0
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

// Figment keys are always strings, so YAML `3:` and env `"3"` arrive alike.
fn deserialize_channel_map<'de, D>(deserializer: D) -> Result<BTreeMap<ChannelId, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    BTreeMap::<String, f64>::deserialize(deserializer)?
        .into_iter()
        .map(|(key, volts)| {
            key.trim()
                .parse::<ChannelId>()
                .map(|id| (id, volts))
                .map_err(|_| serde::de::Error::custom(format!("invalid channel id '{key}'")))
        })
        .collect()
}

impl SetupConfig {
    /// Load configuration from a setup file and `RNPU_` environment variables.
    ///
    /// The file format follows the extension: `.yaml`/`.yml` or `.toml`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DaqError::Configuration(format!(
                "Setup file '{}' does not exist",
                path.display()
            )));
        }

        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
            Some("toml") => Figment::new().merge(Toml::file(path)),
            _ => {
                return Err(DaqError::Configuration(format!(
                    "Unsupported setup file '{}'. Use .yaml, .yml or .toml",
                    path.display()
                )))
            }
        };

        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Parse a YAML document without consulting the environment.
    pub fn from_yaml_str(yaml: &str) -> DaqResult<Self> {
        Ok(Figment::new().merge(Yaml::string(yaml)).extract()?)
    }

    /// Waveform described by the sweep keys.
    pub fn waveform_spec(&self) -> WaveformSpec {
        WaveformSpec::new(self.waveform, self.min_value, self.max_value, self.data_density)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        for (key, range) in [
            ("voltage_range", self.voltage_range),
            ("current_range", self.current_range),
        ] {
            if !(range[0].is_finite() && range[1].is_finite()) || range[0] > range[1] {
                return invalid(format!(
                    "{key} must be an ordered [min, max] pair, got [{}, {}]",
                    range[0], range[1]
                ));
            }
        }

        if self.min_value > self.max_value {
            return invalid(format!(
                "min_value {} is greater than max_value {}",
                self.min_value, self.max_value
            ));
        }
        if self.data_density == 0 {
            return invalid("data_density must be greater than 0".to_string());
        }
        if self.ramp_points == 0 {
            return invalid("ramp_points must be greater than 0".to_string());
        }
        if self.amplification == 0.0 || !self.amplification.is_finite() {
            return invalid(format!(
                "amplification must be finite and non-zero, got {}",
                self.amplification
            ));
        }

        if let Some(smu) = &self.smu {
            smu.drive_mode()?;
            if smu.device_id.trim().is_empty() {
                return invalid("smu.device_id must not be empty".to_string());
            }
            if !(smu.pause_between_set.is_finite() && smu.pause_between_set >= 0.0) {
                return invalid(format!(
                    "smu.pause_between_set must be >= 0, got {}",
                    smu.pause_between_set
                ));
            }
        }

        if let Some(daq) = &self.daq {
            if !(daq.sample_frequency > 0.0) || !(daq.update_frequency > 0.0) {
                return invalid("daq sample and update frequencies must be positive".to_string());
            }
            if daq.samples_per_measurement == 0 {
                return invalid("daq.samples_per_measurement must be greater than 0".to_string());
            }
            let [lo, hi] = self.voltage_range;
            for (id, volts) in &daq.control_voltages {
                if *volts < lo || *volts > hi {
                    return invalid(format!(
                        "Control voltage {volts} V for channel {id} outside voltage_range [{lo}, {hi}]"
                    ));
                }
            }
        }

        match self.experiment.strategy {
            StrategyKind::CurrentSweep | StrategyKind::VoltageSweep if self.smu.is_none() => {
                invalid(format!(
                    "Strategy {:?} requires an 'smu' section",
                    self.experiment.strategy
                ))
            }
            _ if self.daq.is_none() => {
                invalid(format!(
                    "Strategy {:?} requires a 'daq' section",
                    self.experiment.strategy
                ))
            }
            _ => Ok(()),
        }
    }
}

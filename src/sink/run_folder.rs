//! Filesystem sink: one timestamped folder per run.
//!
//! ```text
//! {output_dir}/{name}-{YYYY-mm-dd_HH-MM-SS}/
//!     setup.META            configuration dump, plus the termination status
//!     input.csv             setpoints, comma separated on one line
//!     output_voltage.csv    chassis voltages, one column per channel
//!     output_current.csv    chassis currents or the strategy's current matrix
//!     source_readback.csv   SMU setpoint and readback
//!     setup.LOG             run log (written by the tracing file layer)
//! ```

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::config::SetupConfig;
use crate::error::{DaqError, DaqResult};
use crate::hardware::ChannelReadings;
use crate::sink::{ExperimentSink, OperatorDecision, OperatorGate};
use crate::waveform::Waveform;

const META_FILE: &str = "setup.META";
const INPUT_FILE: &str = "input.csv";
const VOLTAGE_FILE: &str = "output_voltage.csv";
const CURRENT_FILE: &str = "output_current.csv";
const READBACK_FILE: &str = "source_readback.csv";
const LOG_FILE: &str = "setup.LOG";

/// Run folder sink with an interactive Y/N operator gate.
pub struct RunFolder {
    root: PathBuf,
    operator_input: Box<dyn BufRead + Send>,
    prompt_output: Box<dyn Write + Send>,
    terminated_normally: Option<bool>,
}

impl RunFolder {
    /// Create the run folder under `config.output_dir` and write the
    /// configuration dump and the setpoints.
    pub fn create(config: &SetupConfig, input: &Waveform) -> DaqResult<Self> {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        let root = config.output_dir.join(format!("{}-{}", config.name, stamp));
        Self::create_at(root, config, input)
    }

    /// Create the run folder at an explicit path.
    pub fn create_at(
        root: impl Into<PathBuf>,
        config: &SetupConfig,
        input: &Waveform,
    ) -> DaqResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let meta = serde_yaml::to_string(config).map_err(|e| {
            DaqError::Configuration(format!("Failed to serialize setup: {e}"))
        })?;
        fs::write(root.join(META_FILE), meta)?;
        fs::write(root.join(INPUT_FILE), format!("{input}\n"))?;

        info!(path = %root.display(), setpoints = input.len(), "Run folder created");
        Ok(Self {
            root,
            operator_input: Box::new(BufReader::new(io::stdin())),
            prompt_output: Box::new(io::stderr()),
            terminated_normally: None,
        })
    }

    /// Read operator answers from `reader` instead of stdin.
    pub fn with_operator_input(mut self, reader: impl BufRead + Send + 'static) -> Self {
        self.operator_input = Box::new(reader);
        self
    }

    /// Show prompts on `writer` instead of stderr.
    pub fn with_prompt_output(mut self, writer: impl Write + Send + 'static) -> Self {
        self.prompt_output = Box::new(writer);
        self
    }

    /// Folder holding the run files.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of the run log file.
    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    /// Record how the run ended and append it to `setup.META`.
    pub fn close(mut self, terminated_normally: bool) -> DaqResult<()> {
        self.terminated_normally = Some(terminated_normally);
        let mut meta = OpenOptions::new()
            .append(true)
            .open(self.root.join(META_FILE))?;
        writeln!(meta, "terminated_normally: {terminated_normally}")?;
        if terminated_normally {
            info!(path = %self.root.display(), "Run terminated normally");
        } else {
            error!(path = %self.root.display(), "Run did not terminate normally");
        }
        Ok(())
    }

    fn write_readings(&self, file: &str, rows: &[ChannelReadings]) -> DaqResult<()> {
        let channels: BTreeSet<_> = rows.iter().flat_map(|row| row.keys().copied()).collect();
        let mut writer = csv::Writer::from_writer(File::create(self.root.join(file))?);
        writer.write_record(channels.iter().map(|id| format!("Channel {id}")))?;
        for row in rows {
            writer.write_record(
                channels
                    .iter()
                    .map(|id| row.get(id).copied().unwrap_or(f64::NAN).to_string()),
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl Drop for RunFolder {
    fn drop(&mut self) {
        if self.terminated_normally.is_none() {
            error!(path = %self.root.display(), "Run folder dropped without a termination status");
        }
    }
}

impl std::fmt::Debug for RunFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunFolder").field("root", &self.root).finish()
    }
}

impl OperatorGate for RunFolder {
    fn wait_for_user_input(&mut self, prompt: &str) -> DaqResult<OperatorDecision> {
        loop {
            write!(self.prompt_output, "{prompt} [Y/N]: ")?;
            self.prompt_output.flush()?;

            let mut line = String::new();
            if self.operator_input.read_line(&mut line)? == 0 {
                info!("Operator input closed, aborting");
                return Ok(OperatorDecision::Abort);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(OperatorDecision::Continue),
                "n" | "no" => {
                    info!("Operator aborted the run");
                    return Ok(OperatorDecision::Abort);
                }
                _ => continue,
            }
        }
    }
}

impl ExperimentSink for RunFolder {
    fn get_input_data(&self) -> DaqResult<Vec<f64>> {
        let text = fs::read_to_string(self.root.join(INPUT_FILE))?;
        text.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.parse::<f64>().map_err(|e| {
                    DaqError::Configuration(format!("Invalid setpoint '{v}' in {INPUT_FILE}: {e}"))
                })
            })
            .collect()
    }

    fn write_voltage(&mut self, rows: &[ChannelReadings]) -> DaqResult<()> {
        self.write_readings(VOLTAGE_FILE, rows)
    }

    fn write_current(&mut self, rows: &[ChannelReadings]) -> DaqResult<()> {
        self.write_readings(CURRENT_FILE, rows)
    }

    fn write_current_matrix(&mut self, rows: &[Vec<f64>]) -> DaqResult<()> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(File::create(self.root.join(CURRENT_FILE))?);
        for row in rows {
            writer.write_record(row.iter().map(f64::to_string))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_source_readback(&mut self, rows: &[(f64, f64)]) -> DaqResult<()> {
        let mut writer = csv::Writer::from_writer(File::create(self.root.join(READBACK_FILE))?);
        writer.write_record(["setpoint", "readback"])?;
        for (setpoint, readback) in rows {
            writer.write_record([setpoint.to_string(), readback.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

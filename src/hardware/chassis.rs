//! Multi-channel DAQ chassis.
//!
//! The chassis owns one [`DeviceChannel`] per configured activation id and
//! one per readout id. Activation and readout ids live in separate
//! namespaces: `ao0` and `ai0` are distinct lines.
//!
//! Construction never energizes anything. Every activation channel is ramped
//! to 0 V right away; the configured static targets are only applied by
//! [`DaqChassis::start_active_all_channels`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::SetupConfig;
use crate::error::{DaqError, DaqResult};
use crate::hardware::channel::{ChannelRole, ChannelSettings, DeviceChannel};
use crate::hardware::{AnalogBus, Bounds, ChannelId};

/// Channel id to reading, ordered by id.
pub type ChannelReadings = BTreeMap<ChannelId, f64>;

/// A DAQ chassis with its activation and readout channel sets.
pub struct DaqChassis {
    activation_module: String,
    readout_module: String,
    activation: BTreeMap<ChannelId, DeviceChannel>,
    targets: BTreeMap<ChannelId, f64>,
    readout: BTreeMap<ChannelId, DeviceChannel>,
    shut_down: bool,
}

impl DaqChassis {
    /// Resolve the configured modules on `bus` and build the channel sets.
    pub fn new(config: &SetupConfig, bus: Arc<dyn AnalogBus>) -> DaqResult<Self> {
        let daq = config.daq.as_ref().ok_or_else(|| {
            DaqError::Configuration("No 'daq' section in setup configuration".to_string())
        })?;

        let bounds = Bounds::from_pair(config.voltage_range);
        if !bounds.contains(0.0) {
            return Err(DaqError::Configuration(format!(
                "voltage_range [{}, {}] must include 0 V for the chassis to idle safely",
                bounds.min, bounds.max
            )));
        }
        for (id, volts) in &daq.control_voltages {
            if !bounds.contains(*volts) {
                return Err(DaqError::Configuration(format!(
                    "Control voltage {volts} V for channel {id} outside voltage_range [{}, {}]",
                    bounds.min, bounds.max
                )));
            }
        }

        let attached = bus.module_names()?;
        for module in [&daq.activation_module_id, &daq.readout_module_id] {
            if !attached.iter().any(|name| name == module) {
                return Err(DaqError::DeviceNotFound {
                    device: format!("NIDAQ module {module}"),
                });
            }
        }

        bus.reset_module(&daq.activation_module_id)?;
        if daq.readout_module_id != daq.activation_module_id {
            bus.reset_module(&daq.readout_module_id)?;
        }

        let settings = ChannelSettings {
            averaging_count: daq.samples_per_measurement,
            sample_rate: daq.sample_frequency,
            update_rate: daq.update_frequency,
            bounds,
            ramp_points: config.ramp_points,
            amplification: config.amplification,
        };

        let activation = daq
            .control_voltages
            .keys()
            .map(|&id| {
                let channel = DeviceChannel::new(
                    id,
                    ChannelRole::Activation,
                    daq.activation_module_id.as_str(),
                    settings,
                    Arc::clone(&bus),
                );
                (id, channel)
            })
            .collect();
        let readout = daq
            .readout_channels
            .iter()
            .map(|&id| {
                let channel = DeviceChannel::new(
                    id,
                    ChannelRole::Readout,
                    daq.readout_module_id.as_str(),
                    settings,
                    Arc::clone(&bus),
                );
                (id, channel)
            })
            .collect();

        let mut chassis = Self {
            activation_module: daq.activation_module_id.clone(),
            readout_module: daq.readout_module_id.clone(),
            activation,
            targets: daq.control_voltages.clone(),
            readout,
            shut_down: false,
        };

        for channel in chassis.activation.values_mut() {
            channel.ramp_to_voltage(0.0)?;
        }
        info!(
            activation_module = %chassis.activation_module,
            readout_module = %chassis.readout_module,
            activation_channels = chassis.activation.len(),
            readout_channels = chassis.readout.len(),
            "DAQ chassis ready, all activation channels at 0 V"
        );
        Ok(chassis)
    }

    /// Module carrying the activation lines.
    pub fn activation_module(&self) -> &str {
        &self.activation_module
    }

    /// Module carrying the readout lines.
    pub fn readout_module(&self) -> &str {
        &self.readout_module
    }

    /// Activation channel ids, ascending.
    pub fn activation_ids(&self) -> Vec<ChannelId> {
        self.activation.keys().copied().collect()
    }

    /// Readout channel ids, ascending.
    pub fn readout_ids(&self) -> Vec<ChannelId> {
        self.readout.keys().copied().collect()
    }

    /// Activation channel `id`, if configured.
    pub fn activation_channel(&self, id: ChannelId) -> Option<&DeviceChannel> {
        self.activation.get(&id)
    }

    /// Readout channel `id`, if configured.
    pub fn readout_channel(&self, id: ChannelId) -> Option<&DeviceChannel> {
        self.readout.get(&id)
    }

    /// Configured static target of activation channel `id`.
    pub fn control_voltage(&self, id: ChannelId) -> Option<f64> {
        self.targets.get(&id).copied()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Ramp every activation channel to its configured static target.
    ///
    /// Every channel is attempted; the first failure is returned afterwards.
    pub fn start_active_all_channels(&mut self) -> DaqResult<()> {
        let mut first_error = None;
        for (id, channel) in self.activation.iter_mut() {
            let target = self.targets.get(id).copied().unwrap_or(0.0);
            if let Err(err) = channel.ramp_to_voltage(target) {
                error!(channel = %channel.physical_name(), error = %err, "Failed to activate channel");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(channels = self.activation.len(), "All activation channels at their control voltages");
                Ok(())
            }
        }
    }

    /// Averaged voltage of every readout channel, sampled one after another.
    pub fn measure_voltage_all_channels(&self) -> DaqResult<ChannelReadings> {
        self.readout
            .iter()
            .map(|(id, channel)| Ok((*id, channel.measure_voltage()?)))
            .collect()
    }

    /// Averaged current of every readout channel, sampled one after another.
    pub fn measure_current_all_channels(&self) -> DaqResult<ChannelReadings> {
        self.readout
            .iter()
            .map(|(id, channel)| Ok((*id, channel.measure_current()?)))
            .collect()
    }

    /// Averaged voltage of readout channel `id`.
    pub fn measure_voltage(&self, id: ChannelId) -> DaqResult<f64> {
        self.readout_for(id)?.measure_voltage()
    }

    /// Averaged current of readout channel `id`.
    pub fn measure_current(&self, id: ChannelId) -> DaqResult<f64> {
        self.readout_for(id)?.measure_current()
    }

    /// Drive activation channel `id` to `target`, ramped or in a single step.
    pub fn set_voltage(&mut self, id: ChannelId, target: f64, ramp: bool) -> DaqResult<()> {
        let module = &self.activation_module;
        let channel = self
            .activation
            .get_mut(&id)
            .ok_or_else(|| DaqError::InvalidChannel {
                channel: format!("{module}/ao{id}"),
                reason: "not a configured activation channel".to_string(),
            })?;
        if ramp {
            channel.ramp_to_voltage(target)
        } else {
            channel.set_voltage(target)
        }
    }

    fn readout_for(&self, id: ChannelId) -> DaqResult<&DeviceChannel> {
        self.readout.get(&id).ok_or_else(|| DaqError::InvalidChannel {
            channel: format!("{}/ai{id}", self.readout_module),
            reason: "not a configured readout channel".to_string(),
        })
    }

    /// Ramp every activation channel back to 0 V.
    ///
    /// Only the first call talks to the hardware. Every channel is attempted
    /// even if some fault.
    pub fn shutdown(&mut self) -> DaqResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let errors: Vec<DaqError> = self
            .activation
            .values_mut()
            .filter_map(|channel| channel.shutdown().err())
            .collect();

        if errors.is_empty() {
            info!(module = %self.activation_module, "DAQ chassis shutdown");
            Ok(())
        } else {
            warn!(failed = errors.len(), "DAQ chassis shutdown incomplete");
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl std::fmt::Debug for DaqChassis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaqChassis")
            .field("activation_module", &self.activation_module)
            .field("readout_module", &self.readout_module)
            .field("activation", &self.activation.keys().collect::<Vec<_>>())
            .field("readout", &self.readout.keys().collect::<Vec<_>>())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

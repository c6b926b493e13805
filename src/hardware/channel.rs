//! A single chassis line with ramped actuation and averaged measurement.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::{DaqError, DaqResult};
use crate::hardware::{AnalogBus, Bounds, ChannelId, InputKind};
use crate::waveform::ramp_profile;

/// Which side of the chassis a channel lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Analog output used to apply a stimulus
    Activation,
    /// Analog input used to sample a response
    Readout,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Activation => write!(f, "activation"),
            ChannelRole::Readout => write!(f, "readout"),
        }
    }
}

/// Timing and scaling shared by every channel of a chassis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSettings {
    /// Samples averaged into one reading
    pub averaging_count: usize,
    /// Acquisition sample rate (Hz)
    pub sample_rate: f64,
    /// Output update rate used for ramp bursts (Hz)
    pub update_rate: f64,
    /// Permitted output range
    pub bounds: Bounds,
    /// Points in a ramp burst
    pub ramp_points: usize,
    /// Transimpedance gain the current readout is divided by
    pub amplification: f64,
}

/// One physical line, owned by exactly one [`DaqChassis`](crate::hardware::DaqChassis).
///
/// `last_commanded_value` reflects the last *confirmed* command. A faulted
/// actuation leaves it untouched.
pub struct DeviceChannel {
    id: ChannelId,
    role: ChannelRole,
    module: String,
    physical: String,
    last_commanded_value: f64,
    settings: ChannelSettings,
    bus: Arc<dyn AnalogBus>,
}

impl DeviceChannel {
    /// Create a channel zeroed in software. No hardware command is issued.
    pub fn new(
        id: ChannelId,
        role: ChannelRole,
        module: impl Into<String>,
        settings: ChannelSettings,
        bus: Arc<dyn AnalogBus>,
    ) -> Self {
        let module = module.into();
        let physical = match role {
            ChannelRole::Activation => format!("{module}/ao{id}"),
            ChannelRole::Readout => format!("{module}/ai{id}"),
        };
        Self {
            id,
            role,
            module,
            physical,
            last_commanded_value: 0.0,
            settings,
            bus,
        }
    }

    /// Channel number within its module.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Role of the channel.
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Module the line belongs to.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Physical line name passed to the bus.
    pub fn physical_name(&self) -> &str {
        &self.physical
    }

    /// Last confirmed output value (V).
    pub fn last_commanded_value(&self) -> f64 {
        self.last_commanded_value
    }

    /// Averaging and timing settings.
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    fn require_role(&self, role: ChannelRole) -> DaqResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(DaqError::InvalidChannel {
                channel: self.physical.clone(),
                reason: format!("{} channel used as {}", self.role, role),
            })
        }
    }

    /// Single-step actuation to `target`.
    pub fn set_voltage(&mut self, target: f64) -> DaqResult<()> {
        self.require_role(ChannelRole::Activation)?;
        self.settings.bounds.check(&self.physical, target)?;

        match self
            .bus
            .write(&self.physical, self.settings.bounds, &[target], self.settings.update_rate)
        {
            Ok(()) => {
                self.last_commanded_value = target;
                debug!(channel = %self.physical, volts = target, "Voltage set");
                Ok(())
            }
            Err(fault) => {
                error!(channel = %self.physical, error = %fault, "Failed to set voltage");
                Err(fault.into())
            }
        }
    }

    /// Ramp from the last confirmed value to `target` in one continuous burst.
    pub fn ramp_to_voltage(&mut self, target: f64) -> DaqResult<()> {
        self.require_role(ChannelRole::Activation)?;
        self.settings.bounds.check(&self.physical, target)?;

        let profile = ramp_profile(self.last_commanded_value, target, self.settings.ramp_points);
        match self
            .bus
            .write(&self.physical, self.settings.bounds, &profile, self.settings.update_rate)
        {
            Ok(()) => {
                debug!(
                    channel = %self.physical,
                    from = self.last_commanded_value,
                    to = target,
                    points = profile.len(),
                    "Ramp complete"
                );
                self.last_commanded_value = target;
                Ok(())
            }
            Err(fault) => {
                error!(channel = %self.physical, error = %fault, "Failed to ramp voltage");
                Err(fault.into())
            }
        }
    }

    /// Averaged voltage reading (V).
    pub fn measure_voltage(&self) -> DaqResult<f64> {
        self.acquire(InputKind::Voltage)
    }

    /// Averaged current reading (A), divided by the readout amplification.
    pub fn measure_current(&self) -> DaqResult<f64> {
        Ok(self.acquire(InputKind::Current)? / self.settings.amplification)
    }

    fn acquire(&self, kind: InputKind) -> DaqResult<f64> {
        self.require_role(ChannelRole::Readout)?;

        let samples = self
            .bus
            .read(
                &self.physical,
                kind,
                self.settings.averaging_count,
                self.settings.sample_rate,
            )
            .map_err(|fault| {
                error!(channel = %self.physical, error = %fault, "Acquisition failed");
                DaqError::from(fault)
            })?;

        if samples.is_empty() {
            error!(channel = %self.physical, "Acquisition returned no samples");
            return Err(DaqError::NoMeasurement {
                device: format!("NIDAQ {}", self.physical),
            });
        }
        Ok(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Ramp back to 0 V regardless of what the last command was believed to be.
    ///
    /// Readout channels hold no output state and need no action.
    pub fn shutdown(&mut self) -> DaqResult<()> {
        if self.role == ChannelRole::Readout {
            return Ok(());
        }
        self.ramp_to_voltage(0.0)?;
        info!(channel = %self.physical, "Channel shutdown");
        Ok(())
    }
}

impl fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("physical", &self.physical)
            .field("role", &self.role)
            .field("last_commanded_value", &self.last_commanded_value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedBus;

    fn settings() -> ChannelSettings {
        ChannelSettings {
            averaging_count: 4,
            sample_rate: 1000.0,
            update_rate: 100.0,
            bounds: Bounds::from_pair([-1.0, 1.0]),
            ramp_points: 5,
            amplification: 1.0,
        }
    }

    fn activation(bus: &SimulatedBus) -> DeviceChannel {
        DeviceChannel::new(
            0,
            ChannelRole::Activation,
            "cDAQ1Mod1",
            settings(),
            Arc::new(bus.clone()),
        )
    }

    fn readout(bus: &SimulatedBus, settings: ChannelSettings) -> DeviceChannel {
        DeviceChannel::new(3, ChannelRole::Readout, "cDAQ1Mod2", settings, Arc::new(bus.clone()))
    }

    #[test]
    fn physical_names_follow_role() {
        let bus = SimulatedBus::new(["cDAQ1Mod1", "cDAQ1Mod2"]);
        assert_eq!(activation(&bus).physical_name(), "cDAQ1Mod1/ao0");
        assert_eq!(readout(&bus, settings()).physical_name(), "cDAQ1Mod2/ai3");
    }

    #[test]
    fn ramp_issues_one_burst_from_last_value() {
        let bus = SimulatedBus::new(["cDAQ1Mod1"]);
        let mut ch = activation(&bus);

        ch.ramp_to_voltage(0.8).unwrap();
        ch.ramp_to_voltage(0.4).unwrap();

        let writes = bus.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].samples.len(), 5);
        assert_eq!(writes[0].samples[0], 0.0);
        assert_eq!(writes[0].samples[4], 0.8);
        assert_eq!(writes[1].samples[0], 0.8);
        assert_eq!(writes[1].samples[4], 0.4);
        assert_eq!(ch.last_commanded_value(), 0.4);
    }

    #[test]
    fn faulted_actuation_keeps_last_confirmed_value() {
        let bus = SimulatedBus::new(["cDAQ1Mod1"]);
        let mut ch = activation(&bus);
        ch.set_voltage(0.5).unwrap();

        bus.fail_writes_on("cDAQ1Mod1/ao0");
        assert!(matches!(ch.ramp_to_voltage(0.9), Err(DaqError::Hardware(_))));
        assert!(matches!(ch.set_voltage(0.9), Err(DaqError::Hardware(_))));
        assert_eq!(ch.last_commanded_value(), 0.5);
    }

    #[test]
    fn out_of_bounds_target_is_rejected_without_bus_traffic() {
        let bus = SimulatedBus::new(["cDAQ1Mod1"]);
        let mut ch = activation(&bus);
        assert!(matches!(
            ch.set_voltage(1.5),
            Err(DaqError::OutOfBounds { .. })
        ));
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn measurement_is_the_mean_of_the_acquisition() {
        let bus = SimulatedBus::new(["cDAQ1Mod2"]);
        bus.set_input_samples("cDAQ1Mod2/ai3", vec![1.0, 2.0, 3.0, 6.0]);
        let ch = readout(&bus, settings());
        assert_eq!(ch.measure_voltage().unwrap(), 3.0);
    }

    #[test]
    fn current_is_divided_by_amplification() {
        let bus = SimulatedBus::new(["cDAQ1Mod2"]);
        bus.set_input_level("cDAQ1Mod2/ai3", 2.0);
        let mut s = settings();
        s.amplification = 100.0;
        let ch = readout(&bus, s);
        assert!((ch.measure_current().unwrap() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn empty_acquisition_is_no_measurement() {
        let bus = SimulatedBus::new(["cDAQ1Mod2"]);
        bus.empty_read_at(1);
        let ch = readout(&bus, settings());
        assert!(matches!(
            ch.measure_voltage(),
            Err(DaqError::NoMeasurement { .. })
        ));
        assert!(ch.measure_voltage().is_ok());
    }

    #[test]
    fn roles_are_not_interchangeable() {
        let bus = SimulatedBus::new(["cDAQ1Mod1", "cDAQ1Mod2"]);
        let ch = activation(&bus);
        assert!(matches!(
            ch.measure_voltage(),
            Err(DaqError::InvalidChannel { .. })
        ));
        let mut input = readout(&bus, settings());
        assert!(matches!(
            input.set_voltage(0.1),
            Err(DaqError::InvalidChannel { .. })
        ));
        assert!(input.shutdown().is_ok());
    }

    #[test]
    fn shutdown_ramps_to_zero_even_after_a_fault() {
        let bus = SimulatedBus::new(["cDAQ1Mod1"]);
        let mut ch = activation(&bus);
        ch.ramp_to_voltage(0.6).unwrap();
        bus.fail_writes_on("cDAQ1Mod1/ao0");
        assert!(ch.ramp_to_voltage(-0.6).is_err());
        bus.clear_faults();

        ch.shutdown().unwrap();
        let last = bus.writes().pop().unwrap();
        assert_eq!(last.samples[0], 0.6);
        assert_eq!(*last.samples.last().unwrap(), 0.0);
        assert_eq!(ch.last_commanded_value(), 0.0);
    }
}

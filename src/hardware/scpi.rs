//! SCPI driver for Keithley 2400-series source-measure units.
//!
//! Commands are newline terminated; queries read one newline-terminated
//! response. The response element format is fixed to `VOLT,CURR` right
//! after reset so every `:MEAS` query answers with a voltage and a current.
//!
//! An empty or unparseable measurement response is reported as "no data"
//! (`Ok(None)`); a transport error is a [`HardwareFault`].
//!
//! Transports: RS-232 ports (`instrument_serial`) and VISA resources such as
//! `GPIB0::15::INSTR` (`instrument_visa`, needs the system VISA library).

use std::io::{Read, Write};
use std::time::Duration;

use tracing::trace;

use crate::error::{DaqResult, HardwareFault};
use crate::hardware::{BusResult, ComplianceLimits, DriveMode, SmuConnector, SmuDriver};

#[cfg(any(feature = "instrument_serial", feature = "instrument_visa"))]
use crate::error::DaqError;

const TERMINATOR: &str = "\n";

/// Keithley 2400 over any byte stream transport.
pub struct Keithley2400<T> {
    transport: T,
    device_id: String,
}

impl<T: Read + Write + Send> Keithley2400<T> {
    /// Wrap an open transport to the instrument at `device_id`.
    pub fn new(transport: T, device_id: impl Into<String>) -> Self {
        Self {
            transport,
            device_id: device_id.into(),
        }
    }

    /// Consume the driver and return the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn fault(&self, err: impl std::fmt::Display) -> HardwareFault {
        HardwareFault::new(self.device_id.clone(), err.to_string())
    }

    /// Send a command without expecting a response.
    pub fn command(&mut self, command: &str) -> BusResult<()> {
        trace!(device = %self.device_id, command, "SCPI command");
        self.transport
            .write_all(format!("{command}{TERMINATOR}").as_bytes())
            .and_then(|_| self.transport.flush())
            .map_err(|e| self.fault(format!("write '{command}' failed: {e}")))
    }

    /// Send a query and return the trimmed response line.
    pub fn query(&mut self, command: &str) -> BusResult<String> {
        self.command(command)?;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.transport.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => line.push(byte[0]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fault(format!("read after '{command}' failed: {e}"))),
            }
        }
        let response = String::from_utf8_lossy(&line).trim().to_string();
        trace!(device = %self.device_id, command, response = %response, "SCPI response");
        Ok(response)
    }

    fn measure(&mut self, command: &str, field: usize) -> BusResult<Option<f64>> {
        let response = self.query(command)?;
        Ok(parse_field(&response, field))
    }
}

/// Parse field `index` of a comma separated SCPI response.
pub fn parse_field(response: &str, index: usize) -> Option<f64> {
    response
        .split(',')
        .nth(index)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

impl<T: Read + Write + Send> SmuDriver for Keithley2400<T> {
    fn identify(&mut self) -> BusResult<String> {
        self.query("*IDN?")
    }

    fn reset(&mut self) -> BusResult<()> {
        self.command("*RST")?;
        self.command(":FORM:ELEM VOLT,CURR")
    }

    fn clear(&mut self) -> BusResult<()> {
        self.command("*CLS")
    }

    fn select_source(&mut self, mode: DriveMode) -> BusResult<()> {
        match mode {
            DriveMode::CurrentDriven => {
                self.command(":SOUR:FUNC CURR")?;
                self.command(":SOUR:CURR:MODE FIX")?;
                self.command(":SENS:FUNC \"VOLT\"")
            }
            DriveMode::VoltageDriven => {
                self.command(":SOUR:FUNC VOLT")?;
                self.command(":SOUR:VOLT:MODE FIX")?;
                self.command(":SENS:FUNC \"CURR\"")
            }
        }
    }

    fn set_compliance(&mut self, limits: ComplianceLimits) -> BusResult<()> {
        self.command(&format!(":SENS:VOLT:PROT {}", limits.voltage_max))?;
        self.command(&format!(":SENS:CURR:PROT {}", limits.current_max))
    }

    fn enable_output(&mut self) -> BusResult<()> {
        self.command(":OUTP ON")
    }

    fn disable_output(&mut self) -> BusResult<()> {
        self.command(":OUTP OFF")
    }

    fn use_front_terminals(&mut self) -> BusResult<()> {
        self.command(":ROUT:TERM FRON")
    }

    fn configure_integration(
        &mut self,
        nplc: f64,
        source_delay: Duration,
        trigger_count: u32,
    ) -> BusResult<()> {
        self.command(&format!(":SENS:CURR:NPLC {nplc}"))?;
        self.command(&format!(":SENS:VOLT:NPLC {nplc}"))?;
        self.command(&format!(":SOUR:DEL {}", source_delay.as_secs_f64()))?;
        self.command(&format!(":TRIG:COUN {trigger_count}"))
    }

    fn source_current(&mut self, amps: f64) -> BusResult<()> {
        self.command(&format!(":SOUR:CURR:LEV {amps:e}"))
    }

    fn source_voltage(&mut self, volts: f64) -> BusResult<()> {
        self.command(&format!(":SOUR:VOLT:LEV {volts:e}"))
    }

    fn read_voltage(&mut self) -> BusResult<Option<f64>> {
        self.measure(":MEAS:VOLT?", 0)
    }

    fn read_current(&mut self) -> BusResult<Option<f64>> {
        self.measure(":MEAS:CURR?", 1)
    }
}

/// Connects to SMUs on serial ports; the device id is the port name.
#[derive(Debug, Clone)]
pub struct SerialSmuConnector {
    baud_rate: u32,
}

impl SerialSmuConnector {
    /// Connector opening ports at `baud_rate`.
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

#[cfg(feature = "instrument_serial")]
impl SmuConnector for SerialSmuConnector {
    fn connect(&self, device_id: &str, timeout: Duration) -> DaqResult<Box<dyn SmuDriver>> {
        let port = serialport::new(device_id, self.baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| {
                tracing::error!(device = %device_id, error = %e, "Failed to open serial port");
                DaqError::DeviceNotFound {
                    device: format!("SMU {device_id}"),
                }
            })?;

        let mut driver = Keithley2400::new(port, device_id);
        match driver.identify() {
            Ok(idn) if !idn.is_empty() => Ok(Box::new(driver)),
            _ => Err(DaqError::DeviceNotFound {
                device: format!("SMU {device_id}"),
            }),
        }
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl SmuConnector for SerialSmuConnector {
    fn connect(&self, _device_id: &str, _timeout: Duration) -> DaqResult<Box<dyn SmuDriver>> {
        Err(crate::error::DaqError::FeatureNotEnabled(
            "instrument_serial".to_string(),
        ))
    }
}

/// Whether `device_id` is a VISA resource string such as `GPIB0::15::INSTR`.
pub fn is_visa_resource(device_id: &str) -> bool {
    device_id.contains("::")
}

/// Pick the connector for `device_id`: VISA for resource strings, serial otherwise.
pub fn connector_for(device_id: &str, baud_rate: u32) -> Box<dyn SmuConnector + Send> {
    if is_visa_resource(device_id) {
        Box::new(VisaSmuConnector)
    } else {
        Box::new(SerialSmuConnector::new(baud_rate))
    }
}

/// Connects to SMUs through the system VISA library (GPIB, USB-TMC, LXI).
#[derive(Debug, Clone, Copy, Default)]
pub struct VisaSmuConnector;

/// An open VISA session together with the resource manager that owns it.
#[cfg(feature = "instrument_visa")]
struct VisaSession {
    // Declared first so it closes before the resource manager.
    instrument: visa_rs::Instrument,
    _rm: visa_rs::DefaultRM,
}

#[cfg(feature = "instrument_visa")]
impl Read for VisaSession {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.instrument.read(buf)
    }
}

#[cfg(feature = "instrument_visa")]
impl Write for VisaSession {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.instrument.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.instrument.flush()
    }
}

#[cfg(feature = "instrument_visa")]
impl SmuConnector for VisaSmuConnector {
    fn connect(&self, device_id: &str, timeout: Duration) -> DaqResult<Box<dyn SmuDriver>> {
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let not_found = |reason: String| {
            tracing::error!(device = %device_id, error = %reason, "Failed to open VISA resource");
            DaqError::DeviceNotFound {
                device: format!("SMU {device_id}"),
            }
        };

        let resource = CString::new(device_id).map_err(|_| {
            DaqError::Configuration(format!("VISA resource '{device_id}' contains a NUL byte"))
        })?;
        let rm = DefaultRM::new().map_err(|e| not_found(e.to_string()))?;
        let instrument = rm
            .open(&resource.into(), AccessMode::NO_LOCK, timeout)
            .map_err(|e| not_found(e.to_string()))?;

        let session = VisaSession {
            instrument,
            _rm: rm,
        };
        let mut driver = Keithley2400::new(session, device_id);
        match driver.identify() {
            Ok(idn) if !idn.is_empty() => Ok(Box::new(driver)),
            _ => Err(not_found("empty *IDN? response".to_string())),
        }
    }
}

#[cfg(not(feature = "instrument_visa"))]
impl SmuConnector for VisaSmuConnector {
    fn connect(&self, _device_id: &str, _timeout: Duration) -> DaqResult<Box<dyn SmuDriver>> {
        Err(crate::error::DaqError::FeatureNotEnabled(
            "instrument_visa".to_string(),
        ))
    }
}

//! Serial transport for RS-232/USB-serial potentiostats.
//!
//! Wraps the `serialport` crate. The port timeout bounds every single read; the
//! Modbus layer above turns an expired timeout into a retriable error.

use crate::config::DeviceSettings;
use crate::hardware::transport::Transport;
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Builder for constructing a [`SerialTransport`] with custom configuration.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use potentiostat_daq::hardware::SerialTransportBuilder;
///
/// let transport = SerialTransportBuilder::new("/dev/ttyUSB0", 1_500_000)
///     .with_timeout(Duration::from_millis(50))
///     .open()?;
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct SerialTransportBuilder {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialTransportBuilder {
    /// Create a new builder with required parameters
    ///
    /// Default configuration:
    /// * timeout: 30 ms (the firmware answers within a few ms at 1.5 Mbaud)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(30),
        }
    }

    /// Build from the `[device]` configuration section.
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        Self::new(settings.port.clone(), settings.baud_rate)
            .with_timeout(Duration::from_millis(settings.timeout_ms))
    }

    /// Set the per-read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open the port (8N1, no flow control).
    pub fn open(self) -> io::Result<SerialTransport> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(io::Error::from)?;

        debug!(
            port = %self.port_name,
            baud = self.baud_rate,
            timeout_ms = self.timeout.as_millis() as u64,
            "Opened serial port"
        );

        Ok(SerialTransport {
            port_name: self.port_name,
            timeout: self.timeout,
            port,
        })
    }
}

/// Serial link to the instrument.
pub struct SerialTransport {
    port_name: String,
    timeout: Duration,
    port: Box<dyn SerialPort>,
}

impl Transport for SerialTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        trace!(port = %self.port_name, frame = ?frame, "serial tx");
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn receive_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let start = Instant::now();
        let mut filled = 0;

        while filled < buf.len() {
            if start.elapsed() > self.timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("serial read timeout after {:?}", self.timeout),
                ));
            }
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected EOF from serial port",
                    ))
                }
                Ok(n) => filled += n,
                // Port timeout is shorter than our overall timeout
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn describe(&self) -> String {
        format!("serial {}", self.port_name)
    }
}

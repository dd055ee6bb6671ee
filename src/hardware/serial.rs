//! Serial port transport for real adapters (USB, RS232, Bluetooth SPP)

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    io::{self, ErrorKind, Read, Write},
    time::Duration,
};

use log::{debug, warn};
use serialport::SerialPort;

use crate::channel::{ByteChannel, ChannelError, ChannelResult};

/// Baud rate ELM327 clones ship with
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Byte channel on a serial port. The port is opened by [ByteChannel::open]
pub struct SerialPortChannel {
    path: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl Debug for SerialPortChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "SerialPortChannel {} @ {}", self.path, self.baud_rate)
    }
}

impl SerialPortChannel {
    /// Creates a channel for the port at `path`
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout: Duration::from_millis(1),
            port: None,
        }
    }

    /// Wraps an already opened port. [ByteChannel::open] is then a no-op
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self {
            path: port.name().unwrap_or_default(),
            baud_rate: port.baud_rate().unwrap_or(DEFAULT_BAUD_RATE),
            timeout: port.timeout(),
            port: Some(port),
        }
    }

    /// The underlying port, while open. Used to change the baud rate from
    /// [crate::hardware::AdapterEventHandler::on_device_initializable]
    pub fn port_mut(&mut self) -> Option<&mut Box<dyn SerialPort>> {
        self.port.as_mut()
    }

    fn port(&mut self) -> ChannelResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(ChannelError::InterfaceNotOpen)
    }
}

/// Names of the serial ports present on this machine
pub fn available_ports() -> ChannelResult<Vec<String>> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .map_err(|e| io::Error::from(e).into())
}

impl ByteChannel for SerialPortChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        debug!("Opening {} at {} baud", self.path, self.baud_rate);
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(io::Error::from)?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        if let Some(mut port) = self.port.take() {
            port.flush()?;
        }
        Ok(())
    }

    fn has_space_available(&mut self) -> bool {
        self.port.is_some()
    }

    fn has_bytes_available(&mut self) -> bool {
        match self.port.as_ref().map(|p| p.bytes_to_read()) {
            Some(Ok(n)) => n > 0,
            // Let the read surface the error
            Some(Err(e)) => {
                warn!("Could not query {}: {e}", self.path);
                true
            }
            None => false,
        }
    }

    fn write(&mut self, buffer: &[u8]) -> ChannelResult<usize> {
        match self.port()?.write(buffer) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&mut self, buffer: &mut [u8]) -> ChannelResult<usize> {
        // Only called after readiness was reported, so a timeout here means the device is gone
        Ok(self.port()?.read(buffer)?)
    }
}

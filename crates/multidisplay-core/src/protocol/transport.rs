//! Transport abstraction
//!
//! The core only needs a byte source/sink. Serial ports are supported here;
//! Bluetooth sockets and other links implement [`Transport`] outside the core.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Byte stream to and from the sensor unit
pub trait Transport: Send {
    /// Read available bytes into `buf`. `Ok(0)` means nothing arrived before
    /// the transport's read timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes, returning how many were accepted
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close the link. Further reads and writes fail.
    fn close(&mut self) -> io::Result<()>;

    /// Write the whole buffer
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "transport closed")),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Serial port transport
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl SerialTransport {
    /// Open a serial port. `None` uses the default baud rate.
    pub fn open(
        name: &str,
        baud_rate: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<Self, ProtocolError> {
        let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
        let timeout = timeout.unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS));

        let port = serialport::new(name, baud)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;

        info!(port = name, baud, "Serial port opened");
        Ok(Self::from_port(port))
    }

    /// Wrap an already opened port
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        let name = port.name().unwrap_or_default();
        Self {
            port: Some(port),
            name,
        }
    }

    /// Port name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port()?.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let port = self.port()?;
        let n = port.write(buf)?;
        port.flush()?;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.name, "Serial port closed");
        }
        Ok(())
    }
}

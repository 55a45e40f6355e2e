//! Byte channel abstraction
//!
//! Detection only needs three things from a channel: change its speed,
//! throw away whatever is buffered, and read. [`SerialLink`] captures that
//! so the same sniffer runs over real serial ports, Bluetooth virtual ports,
//! platform multiplexers and simulated channels. Dropping a link closes it.

use std::io;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::debug;

use crate::error::DetectError;

/// An open byte channel that can be re-clocked
pub trait SerialLink: AsyncRead + Send + Unpin {
    /// Change the channel speed
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;

    /// Discard any bytes received but not yet read
    fn discard_input(&mut self) -> io::Result<()>;
}

impl SerialLink for SerialStream {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        SerialPort::set_baud_rate(self, baud_rate).map_err(io::Error::from)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        SerialPort::clear(self, ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens channels for a transport
///
/// One implementation exists per platform transport; devices hold the opener
/// that produced them so they can reopen their channel after a failure.
pub trait LinkOpener: Send + Sync {
    /// Open the channel at `address` clocked at `baud_rate`
    fn open(&self, address: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, DetectError>;
}

/// Opens native serial ports through `tokio-serial`
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    /// Driver-level timeout applied to blocking calls on the port
    pub timeout: Duration,
}

impl SerialPortOpener {
    /// Create an opener with the default driver timeout
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_millis(100),
        }
    }
}

impl Default for SerialPortOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkOpener for SerialPortOpener {
    fn open(&self, address: &str, baud_rate: u32) -> Result<Box<dyn SerialLink>, DetectError> {
        debug!("Opening {} at {} baud", address, baud_rate);

        let stream = tokio_serial::new(address, baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| DetectError::from_open_error(address, &io::Error::from(e)))?;

        Ok(Box::new(stream))
    }
}

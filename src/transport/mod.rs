//! Byte-stream transports
//!
//! A transport is the duplex byte stream a framed session reads from and
//! writes to. Reads are bounded by a caller-supplied timeout so the session
//! can interleave cancellation checks with blocking I/O.
//!
//! - [`SerialTransport`]: a real serial device (requires the `serial` feature)
//! - [`ReplayTransport`]: a scripted byte source for captures and tests

pub mod replay;
#[cfg(feature = "serial")]
pub mod serial;

pub use replay::{ReplayProbe, ReplayTransport, Step};
#[cfg(feature = "serial")]
pub use serial::SerialTransport;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;

/// Baud rate used by the stock acquisition firmware
pub const DEFAULT_BAUD: u32 = 115200;

/// Device path used by the stock acquisition setup
pub const DEFAULT_PORT: &str = "/dev/ttyS0";

/// Duplex byte stream owned by a framed session
pub trait Transport {
    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// `Ok(0)` means nothing arrived in time. Errors are terminal.
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write some prefix of `data`, waiting at most `timeout`.
    ///
    /// Returns the number of bytes accepted; `Ok(0)` means the device did not
    /// accept anything in time.
    fn write_bytes(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release the device. Called at most once by the owning session.
    fn close(&mut self) -> io::Result<()>;

    /// Human readable device name for logs
    fn name(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read_bytes(buf, timeout)
    }

    fn write_bytes(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        (**self).write_bytes(data, timeout)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Parity setting (default: none)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParitySetting {
    #[default]
    None,
    Even,
    Odd,
}

/// Flow control setting (default: none)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControlSetting {
    #[default]
    None,
    Software,
    Hardware,
}

impl fmt::Display for ParitySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParitySetting::None => write!(f, "none"),
            ParitySetting::Even => write!(f, "even"),
            ParitySetting::Odd => write!(f, "odd"),
        }
    }
}

impl fmt::Display for FlowControlSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowControlSetting::None => write!(f, "none"),
            FlowControlSetting::Software => write!(f, "software"),
            FlowControlSetting::Hardware => write!(f, "hardware"),
        }
    }
}

/// Configuration for opening a serial transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Serial port path (e.g., /dev/ttyS0, /dev/ttyACM0)
    pub port_path: String,
    /// Symbol rate (default: 115200)
    pub baud_rate: u32,
    /// Data bits, 5 through 8 (default: 8)
    pub data_bits: u8,
    pub parity: ParitySetting,
    /// Stop bits, 1 or 2 (default: 1)
    pub stop_bits: u8,
    pub flow_control: FlowControlSetting,
    /// Default read/write deadline of the driver
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port_path: String::from(DEFAULT_PORT),
            baud_rate: DEFAULT_BAUD,
            data_bits: 8,
            parity: ParitySetting::None,
            stop_bits: 1,
            flow_control: FlowControlSetting::None,
            timeout: Duration::from_millis(100),
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default settings for `port_path`
    pub fn new(port_path: &str) -> Self {
        Self {
            port_path: port_path.to_string(),
            ..Default::default()
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the default driver timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject settings no UART driver accepts.
    pub fn check(&self) -> io::Result<()> {
        if self.port_path.is_empty() {
            return Err(invalid_input("device path is empty"));
        }
        if self.baud_rate == 0 {
            return Err(invalid_input("baud rate must be non-zero"));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(invalid_input(format!(
                "data bits must be 5 through 8, got {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(invalid_input(format!(
                "stop bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

pub(crate) fn invalid_input(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.port_path, "/dev/ttyS0");
        assert_eq!(config.parity, ParitySetting::None);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = TransportConfig::new("/dev/ttyACM0")
            .with_baud_rate(9600)
            .with_timeout(Duration::from_secs(1));

        assert_eq!(config.port_path, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_check_rejects_bad_settings() {
        assert!(TransportConfig::new("/dev/ttyS0").with_baud_rate(0).check().is_err());
        assert!(TransportConfig::new("").check().is_err());

        let mut config = TransportConfig::default();
        config.stop_bits = 3;
        assert!(config.check().is_err());

        let mut config = TransportConfig::default();
        config.data_bits = 9;
        assert_eq!(config.check().unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }
}

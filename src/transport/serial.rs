//! Serial port transport backed by the `serialport` crate

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

use super::{invalid_input, FlowControlSetting, ParitySetting, Transport, TransportConfig};

/// An open serial device
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
    timeout: Duration,
}

impl SerialTransport {
    /// Open a serial device with the given configuration
    pub fn open(config: &TransportConfig) -> io::Result<Self> {
        config.check()?;

        let port = serialport::new(&config.port_path, config.baud_rate)
            .data_bits(data_bits(config.data_bits)?)
            .parity(parity(config.parity))
            .stop_bits(stop_bits(config.stop_bits)?)
            .flow_control(flow_control(config.flow_control))
            .timeout(config.timeout)
            .open()?;

        let name = port.name().unwrap_or_else(|| config.port_path.clone());
        log::debug!("opened {} at {} baud", name, config.baud_rate);

        Ok(Self {
            port,
            name,
            timeout: config.timeout,
        })
    }

    fn apply_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout)?;
            self.timeout = timeout;
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.apply_timeout(timeout)?;
        match self.port.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write_bytes(&mut self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        self.apply_timeout(timeout)?;
        match self.port.write(data) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        // The OS handle is released when the port is dropped
        self.port.flush()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn data_bits(bits: u8) -> io::Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(invalid_input(format!("unsupported data bits: {}", other))),
    }
}

fn stop_bits(bits: u8) -> io::Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(invalid_input(format!("unsupported stop bits: {}", other))),
    }
}

fn parity(setting: ParitySetting) -> Parity {
    match setting {
        ParitySetting::None => Parity::None,
        ParitySetting::Even => Parity::Even,
        ParitySetting::Odd => Parity::Odd,
    }
}

fn flow_control(setting: FlowControlSetting) -> FlowControl {
    match setting {
        FlowControlSetting::None => FlowControl::None,
        FlowControlSetting::Software => FlowControl::Software,
        FlowControlSetting::Hardware => FlowControl::Hardware,
    }
}

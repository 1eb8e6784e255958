//! Protocol profiles
//!
//! A profile describes one acquisition setup: the serial settings of the
//! port, the handshake sentinels the device firmware prints, and the
//! streaming deadlines. Profiles are TOML files; every field falls back to
//! the built-in default, so a profile only needs to name what differs.
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyACM0"
//! baud_rate = 230400
//!
//! [handshake]
//! timeout_ms = 30000
//! ```

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::dispatch::{OverflowPolicy, queue::DEFAULT_CAPACITY};
use crate::error::ProfileError;
use crate::protocol::AcquisitionPlan;
use crate::sentinel::Sentinel;
use crate::session::SessionOptions;
use crate::transport::{
    FlowControlSetting, ParitySetting, TransportConfig, DEFAULT_BAUD, DEFAULT_PORT,
};

/// Built-in profile matching the stock acquisition firmware
pub static DEFAULT_PROFILE: Lazy<ProtocolProfile> = Lazy::new(ProtocolProfile::default);

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path
    pub port: String,
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    pub parity: ParitySetting,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    pub flow_control: FlowControlSetting,
    /// Driver-level read/write timeout
    pub timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD,
            data_bits: 8,
            parity: ParitySetting::None,
            stop_bits: 1,
            flow_control: FlowControlSetting::None,
            timeout_ms: 100,
        }
    }
}

/// Handshake sentinels and trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeSettings {
    pub ready: String,
    pub trigger: String,
    pub transmitting: String,
    pub done: String,
    /// Deadline for each handshake sentinel
    pub timeout_ms: u64,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            ready: "ready".to_string(),
            trigger: "g".to_string(),
            transmitting: "transmitting".to_string(),
            done: "done".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Framing, deadlines and dispatch settings of the streaming phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Record terminator, exactly one byte
    pub delimiter: String,
    pub record_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub write_timeout_ms: u64,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            delimiter: "\n".to_string(),
            record_timeout_ms: 5_000,
            poll_interval_ms: 50,
            write_timeout_ms: 1_000,
            queue_capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Complete acquisition profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolProfile {
    pub serial: SerialSettings,
    pub handshake: HandshakeSettings,
    pub stream: StreamSettings,
}

impl ProtocolProfile {
    /// Load and validate a profile file
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let content = fs::read_to_string(path).map_err(|source| ProfileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let profile = Self::parse(&content)?;
        log::debug!("loaded profile from {}", path.display());
        Ok(profile)
    }

    /// Parse and validate profile TOML
    pub fn parse(content: &str) -> Result<Self, ProfileError> {
        let profile: Self = toml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn to_toml(&self) -> Result<String, ProfileError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the profile as TOML
    pub fn save(&self, path: &Path) -> Result<(), ProfileError> {
        fs::write(path, self.to_toml()?).map_err(|source| ProfileError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the profile for settings no session can run with
    pub fn validate(&self) -> Result<(), ProfileError> {
        let serial = &self.serial;
        self.transport_config().check().map_err(|e| invalid(e.to_string()))?;
        if serial.timeout_ms == 0 {
            return Err(invalid("serial.timeout_ms must be non-zero"));
        }

        let delimiter = self.delimiter()?;
        let handshake = &self.handshake;
        let plan = self.plan();
        for (field, sentinel) in [
            ("ready", &plan.ready),
            ("transmitting", &plan.transmitting),
            ("done", &plan.done),
        ] {
            if sentinel.is_empty() {
                return Err(invalid(format!("handshake.{} must not be empty", field)));
            }
            if sentinel.contains_byte(delimiter) {
                return Err(invalid(format!(
                    "handshake.{} contains the record delimiter",
                    field
                )));
            }
        }
        if handshake.trigger.is_empty() {
            return Err(invalid("handshake.trigger must not be empty"));
        }

        let stream = &self.stream;
        for (field, value) in [
            ("handshake.timeout_ms", handshake.timeout_ms),
            ("stream.record_timeout_ms", stream.record_timeout_ms),
            ("stream.poll_interval_ms", stream.poll_interval_ms),
            ("stream.write_timeout_ms", stream.write_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("{} must be non-zero", field)));
            }
        }
        if stream.queue_capacity == 0 {
            return Err(invalid("stream.queue_capacity must be non-zero"));
        }

        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        let serial = &self.serial;
        TransportConfig {
            port_path: serial.port.clone(),
            baud_rate: serial.baud_rate,
            data_bits: serial.data_bits,
            parity: serial.parity,
            stop_bits: serial.stop_bits,
            flow_control: serial.flow_control,
            timeout: Duration::from_millis(serial.timeout_ms),
        }
    }

    pub fn session_options(&self) -> Result<SessionOptions, ProfileError> {
        Ok(SessionOptions {
            poll_interval: Duration::from_millis(self.stream.poll_interval_ms),
            write_timeout: Duration::from_millis(self.stream.write_timeout_ms),
            delimiter: self.delimiter()?,
        })
    }

    pub fn plan(&self) -> AcquisitionPlan {
        let handshake = &self.handshake;
        AcquisitionPlan {
            ready: Sentinel::from(handshake.ready.as_str()),
            trigger: handshake.trigger.as_bytes().to_vec(),
            transmitting: Sentinel::from(handshake.transmitting.as_str()),
            done: Sentinel::from(handshake.done.as_str()),
            handshake_timeout: Duration::from_millis(handshake.timeout_ms),
            record_timeout: Duration::from_millis(self.stream.record_timeout_ms),
        }
    }

    fn delimiter(&self) -> Result<u8, ProfileError> {
        match self.stream.delimiter.as_bytes() {
            [byte] => Ok(*byte),
            _ => Err(invalid(format!(
                "stream.delimiter must be exactly one byte, got {:?}",
                self.stream.delimiter
            ))),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ProfileError {
    ProfileError::Invalid(msg.into())
}

//! Handshake sentinels
//!
//! A sentinel is a fixed byte sequence the device firmware prints to mark a
//! protocol milestone. The session discards stream bytes until the sentinel
//! appears as a contiguous run, consuming through its last byte.

use std::fmt;

/// Printed by the device once it has booted and waits for the trigger
pub const READY: &[u8] = b"ready";
/// Printed after the trigger byte, right before the first record
pub const TRANSMITTING: &[u8] = b"transmitting";
/// Printed after the last record
pub const DONE: &[u8] = b"done";

/// Byte sent by the host to start a capture
pub const TRIGGER: &[u8] = b"g";

/// Immutable byte sequence marking a handshake milestone
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sentinel(Box<[u8]>);

impl Sentinel {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into().into_boxed_slice())
    }

    pub fn ready() -> Self {
        Self::new(READY)
    }

    pub fn transmitting() -> Self {
        Self::new(TRANSMITTING)
    }

    pub fn done() -> Self {
        Self::new(DONE)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `consumed` ends with the full sentinel.
    pub fn terminates(&self, consumed: &[u8]) -> bool {
        !self.0.is_empty() && consumed.ends_with(&self.0)
    }

    /// True when `bytes` begins with the full sentinel.
    pub fn begins(&self, bytes: impl IntoIterator<Item = u8>) -> bool {
        let mut bytes = bytes.into_iter();
        !self.0.is_empty() && self.0.iter().all(|expected| bytes.next() == Some(*expected))
    }

    pub fn contains_byte(&self, byte: u8) -> bool {
        self.0.contains(&byte)
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0.escape_ascii())
    }
}

impl From<&str> for Sentinel {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes())
    }
}

//! Streamed records and their classification

use chrono::{DateTime, Local};
use std::fmt;

use crate::error::{Result, SessionError};

/// Prefix of a measurement record
pub const SAMPLE_PREFIX: &str = "sample";
/// Prefix of a clock record
pub const TIMESTAMP_PREFIX: &str = "timestamp";

/// Default record delimiter
pub const LINE_DELIMITER: u8 = b'\n';

/// Classification of a record by its leading token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Sample,
    Timestamp,
    Unrecognized,
}

impl RecordKind {
    /// Match the exact, case-sensitive literal prefixes.
    pub fn of(text: &str) -> Self {
        if text.starts_with(SAMPLE_PREFIX) {
            RecordKind::Sample
        } else if text.starts_with(TIMESTAMP_PREFIX) {
            RecordKind::Timestamp
        } else {
            RecordKind::Unrecognized
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Sample => write!(f, "sample"),
            RecordKind::Timestamp => write!(f, "timestamp"),
            RecordKind::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// One delimiter-terminated line of device output, delimiter stripped.
///
/// Stamped with the local time it was decoded. Records compare by text.
#[derive(Debug, Clone)]
pub struct Record {
    text: String,
    received_at: DateTime<Local>,
}

impl Record {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Local::now(),
        }
    }

    /// Decode a raw line as read from the transport.
    ///
    /// The trailing delimiter and a carriage return in front of it are
    /// removed. Invalid UTF-8 is reported, never replaced.
    pub fn decode(mut line: Vec<u8>, delimiter: u8) -> Result<Self> {
        if line.last() == Some(&delimiter) {
            line.pop();
        }
        if delimiter == LINE_DELIMITER && line.last() == Some(&b'\r') {
            line.pop();
        }

        String::from_utf8(line)
            .map(Self::new)
            .map_err(SessionError::Encoding)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> RecordKind {
        classify(self)
    }

    /// When the record came off the transport
    pub fn received_at(&self) -> DateTime<Local> {
        self.received_at
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Record {}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Classify a record by its leading token.
pub fn classify(record: &Record) -> RecordKind {
    RecordKind::of(record.text())
}

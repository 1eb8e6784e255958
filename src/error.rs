//! Error types for serial acquisition.

use std::io;
use std::path::PathBuf;
use std::string::FromUtf8Error;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a framed session and the acquisition driver.
#[derive(Debug, Error)]
pub enum SessionError {
    /// I/O fault on an open transport (disconnect, permission, driver error).
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The device could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The awaited bytes did not arrive before the deadline.
    #[error("timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        timeout: Duration,
    },

    /// A record was not valid UTF-8.
    #[error("record is not valid text ({} bytes): {0}", .0.as_bytes().len())]
    Encoding(#[source] FromUtf8Error),

    /// Cancellation was requested while the session was blocked.
    #[error("session cancelled")]
    Cancelled,

    /// The transport was already released.
    #[error("session is closed")]
    Closed,

    /// A record sink rejected a record.
    #[error("record dispatch failed: {0}")]
    Dispatch(String),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }

    /// True for faults of the underlying device, including failure to open it.
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Transport(_) | SessionError::Open { .. })
    }
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised while loading or validating a protocol profile.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write profile {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid profile syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize profile: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid profile: {0}")]
    Invalid(String),
}

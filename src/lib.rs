//! Serial data acquisition
//!
//! Opens a serial device, runs the firmware handshake (`ready`, trigger byte,
//! `transmitting`) and streams newline-delimited `sample`/`timestamp`
//! records until the device prints `done`.
//!
//! The core is [`FramedSession`], a single-reader framed stream over any
//! [`Transport`] with timeout-bounded, cancellable reads. [`protocol::run`]
//! drives the handshake and hands records to a [`RecordSink`].
//!
//! The serial backend needs the `serial` feature (libudev on Linux);
//! everything else, including [`ReplayTransport`], builds without it.

pub mod cancel;
pub mod dispatch;
pub mod error;
pub mod profile;
pub mod protocol;
pub mod record;
pub mod sentinel;
pub mod session;
pub mod transport;

pub use cancel::CancelToken;
pub use dispatch::{OverflowPolicy, RecordSink};
pub use error::{ProfileError, Result, SessionError};
pub use profile::ProtocolProfile;
pub use protocol::{AcquisitionPlan, AcquisitionReport};
pub use record::{classify, Record, RecordKind};
pub use sentinel::Sentinel;
pub use session::{FramedSession, SessionOptions, SessionState, StreamEvent};
pub use transport::{ReplayTransport, Transport, TransportConfig};
#[cfg(feature = "serial")]
pub use transport::SerialTransport;

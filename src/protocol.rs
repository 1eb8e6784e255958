//! Acquisition protocol driver
//!
//! Runs the device handshake and the streaming phase on top of a
//! [`FramedSession`]:
//!
//! 1. wait for `ready`, send the trigger byte
//! 2. wait for `transmitting`
//! 3. read, classify and dispatch records until `done`
//!
//! Handshake timeouts and transport errors are fatal. While streaming, a
//! timeout or an undecodable line only affects one record.

use log::{debug, info, log_enabled, warn, Level};
use std::fmt;
use std::time::Duration;

use crate::dispatch::RecordSink;
use crate::error::{Result, SessionError};
use crate::record::RecordKind;
use crate::sentinel::{self, Sentinel};
use crate::session::{FramedSession, SessionState, StreamEvent};
use crate::transport::Transport;

/// Default deadline for each handshake sentinel
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for one record while streaming
pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_secs(5);

/// Sentinels, trigger and deadlines of one acquisition run
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPlan {
    pub ready: Sentinel,
    pub trigger: Vec<u8>,
    pub transmitting: Sentinel,
    pub done: Sentinel,
    pub handshake_timeout: Duration,
    pub record_timeout: Duration,
}

impl Default for AcquisitionPlan {
    fn default() -> Self {
        Self {
            ready: Sentinel::ready(),
            trigger: sentinel::TRIGGER.to_vec(),
            transmitting: Sentinel::transmitting(),
            done: Sentinel::done(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            record_timeout: DEFAULT_RECORD_TIMEOUT,
        }
    }
}

/// Outcome of a run that reached `Done` or `Cancelled`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub state: SessionState,
    pub samples: usize,
    pub timestamps: usize,
    /// Records with neither known prefix, not dispatched
    pub unrecognized: usize,
    /// Lines that were not valid text
    pub malformed: usize,
    /// Record deadlines that expired while streaming
    pub idle_timeouts: usize,
    /// Bytes consumed while waiting for handshake sentinels
    pub handshake_bytes: usize,
}

impl AcquisitionReport {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            samples: 0,
            timestamps: 0,
            unrecognized: 0,
            malformed: 0,
            idle_timeouts: 0,
            handshake_bytes: 0,
        }
    }

    pub fn dispatched(&self) -> usize {
        self.samples + self.timestamps
    }
}

impl fmt::Display for AcquisitionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} samples, {} timestamps, {} unrecognized, {} malformed, {} idle timeouts",
            self.state,
            self.samples,
            self.timestamps,
            self.unrecognized,
            self.malformed,
            self.idle_timeouts
        )
    }
}

/// Run the full handshake and stream records into `sink`.
///
/// Returns the report once the session reaches `Done` or `Cancelled`. Any
/// other exit leaves the session `Failed` and closed, and returns the error.
/// The sink is finished before the session is marked `Done`, so a sink that
/// cannot flush fails the run.
pub fn run<T, S>(
    session: &mut FramedSession<T>,
    plan: &AcquisitionPlan,
    sink: &mut S,
) -> Result<AcquisitionReport>
where
    T: Transport,
    S: RecordSink + ?Sized,
{
    let mut report = AcquisitionReport::new();

    match handshake(session, plan, &mut report) {
        Ok(()) => {}
        Err(SessionError::Cancelled) => return finish(session, sink, report),
        Err(e) => return Err(abort(session, e)),
    }

    info!("{}: streaming records", session.device());
    loop {
        match session.next_event(&plan.done, plan.record_timeout) {
            Ok(StreamEvent::End) => break,
            Ok(StreamEvent::Record(record)) => match record.kind() {
                RecordKind::Unrecognized => {
                    report.unrecognized += 1;
                    debug!("skipping unrecognized record: {:?}", record.text());
                }
                kind => {
                    if kind == RecordKind::Sample {
                        report.samples += 1;
                    } else {
                        report.timestamps += 1;
                    }
                    match sink.accept(record) {
                        Ok(()) => {}
                        Err(SessionError::Cancelled) => {
                            session.transition(SessionState::Cancelled);
                            break;
                        }
                        Err(e) => return Err(abort(session, e)),
                    }
                }
            },
            Err(SessionError::Encoding(e)) => {
                report.malformed += 1;
                warn!("skipping malformed record: {}", e);
            }
            Err(e) if e.is_timeout() => {
                report.idle_timeouts += 1;
                debug!("{}", e);
            }
            Err(SessionError::Cancelled) => break,
            Err(e) => return Err(abort(session, e)),
        }
    }

    finish(session, sink, report)
}

fn handshake<T: Transport>(
    session: &mut FramedSession<T>,
    plan: &AcquisitionPlan,
    report: &mut AcquisitionReport,
) -> Result<()> {
    session.transition(SessionState::AwaitingReady);
    let consumed = session.await_sentinel(&plan.ready, plan.handshake_timeout)?;
    trace_handshake(&plan.ready, &consumed);
    report.handshake_bytes += consumed.len();

    session.transition(SessionState::Armed);
    session.send(&plan.trigger)?;
    info!("{}: device ready, trigger sent", session.device());

    session.transition(SessionState::AwaitingTransmitting);
    let consumed = session.await_sentinel(&plan.transmitting, plan.handshake_timeout)?;
    trace_handshake(&plan.transmitting, &consumed);
    report.handshake_bytes += consumed.len();

    session.transition(SessionState::Streaming);
    Ok(())
}

fn trace_handshake(sentinel: &Sentinel, consumed: &[u8]) {
    if log_enabled!(Level::Debug) {
        debug!("consumed {} bytes through {}:", consumed.len(), sentinel);
        for line in hexdump::hexdump_iter(consumed) {
            debug!("  {}", line);
        }
    }
}

fn finish<T, S>(
    session: &mut FramedSession<T>,
    sink: &mut S,
    mut report: AcquisitionReport,
) -> Result<AcquisitionReport>
where
    T: Transport,
    S: RecordSink + ?Sized,
{
    if session.state().is_terminal() {
        // Cancelled
        if let Err(e) = sink.finish() {
            warn!("{}: finishing sink after cancel: {}", session.device(), e);
        }
    } else {
        if let Err(e) = sink.finish() {
            return Err(abort(session, e));
        }
        session.transition(SessionState::Done);
    }

    report.state = session.state();
    info!("{}: {}", session.device(), report);
    Ok(report)
}

fn abort<T: Transport>(session: &mut FramedSession<T>, e: SessionError) -> SessionError {
    warn!("{}: acquisition failed in {}: {}", session.device(), session.state(), e);
    session.transition(SessionState::Failed);
    e
}

//! Framed session over a byte-stream transport
//!
//! The session owns the transport for its whole lifetime and is the only
//! reader. Every blocking call is split into polls of at most
//! [`SessionOptions::poll_interval`], with the cancel token checked before
//! each poll, so a cancelled session returns within one poll interval.
//!
//! Bytes read past a sentinel or a delimiter stay in the session's
//! read-ahead buffer and are the first bytes seen by the next call.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::{Result, SessionError};
use crate::record::{Record, LINE_DELIMITER};
use crate::sentinel::Sentinel;
use crate::transport::Transport;

/// Default upper bound on a single blocking transport read
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default deadline for a stalled write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 256;

/// Handshake and streaming phases of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Open, no handshake performed
    Idle,
    AwaitingReady,
    /// Ready observed, trigger about to be sent
    Armed,
    AwaitingTransmitting,
    Streaming,
    Done,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingReady => "awaiting ready",
            SessionState::Armed => "armed",
            SessionState::AwaitingTransmitting => "awaiting transmitting",
            SessionState::Streaming => "streaming",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Timing and framing options of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Upper bound on one blocking read, and so on cancellation latency
    pub poll_interval: Duration,
    /// How long a write may make no progress before it is a transport error
    pub write_timeout: Duration,
    /// Record terminator
    pub delimiter: u8,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            delimiter: LINE_DELIMITER,
        }
    }
}

impl SessionOptions {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// One streaming step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Record(Record),
    /// The end sentinel was observed at a record boundary
    End,
}

/// Exclusive owner of a transport providing handshake and framed reads
pub struct FramedSession<T: Transport> {
    transport: Option<T>,
    device: String,
    pending: VecDeque<u8>,
    scratch: Box<[u8]>,
    state: SessionState,
    options: SessionOptions,
    cancel: CancelToken,
}

#[cfg(feature = "serial")]
impl FramedSession<crate::transport::SerialTransport> {
    /// Open a serial device
    pub fn open(
        device_path: &str,
        baud_rate: u32,
        options: SessionOptions,
        cancel: CancelToken,
    ) -> Result<Self> {
        let config = crate::transport::TransportConfig::new(device_path).with_baud_rate(baud_rate);
        Self::open_with(&config, options, cancel)
    }

    /// Open a serial device with full port settings
    pub fn open_with(
        config: &crate::transport::TransportConfig,
        options: SessionOptions,
        cancel: CancelToken,
    ) -> Result<Self> {
        let transport =
            crate::transport::SerialTransport::open(config).map_err(|source| SessionError::Open {
                path: config.port_path.clone(),
                source,
            })?;
        Ok(Self::new(transport, options, cancel))
    }
}

impl<T: Transport> FramedSession<T> {
    /// Take ownership of an already open transport
    pub fn new(transport: T, options: SessionOptions, cancel: CancelToken) -> Self {
        let device = transport.name().to_string();
        info!("session opened on {}", device);
        Self {
            transport: Some(transport),
            device,
            pending: VecDeque::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            state: SessionState::Idle,
            options,
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Name of the underlying device
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Bytes read from the transport but not yet consumed
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Move to `next`. Entering a terminal state closes the transport;
    /// once terminal, the state no longer changes.
    pub fn transition(&mut self, next: SessionState) {
        if self.state.is_terminal() || self.state == next {
            return;
        }
        debug!("{}: {} -> {}", self.device, self.state, next);
        self.state = next;
        if next.is_terminal() {
            self.close();
        }
    }

    /// Discard input until `sentinel` has been fully observed.
    ///
    /// Returns every byte consumed, sentinel included. Nothing past the
    /// sentinel's last byte is consumed. On timeout the bytes consumed so
    /// far are dropped; callers needing replay must buffer independently.
    pub fn await_sentinel(&mut self, sentinel: &Sentinel, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = deadline_after(timeout);
        let mut consumed = Vec::new();
        if sentinel.is_empty() {
            return Ok(consumed);
        }

        loop {
            while let Some(byte) = self.pending.pop_front() {
                consumed.push(byte);
                if sentinel.terminates(&consumed) {
                    debug!(
                        "{}: matched {} after {} bytes",
                        self.device,
                        sentinel,
                        consumed.len()
                    );
                    return Ok(consumed);
                }
            }

            if !self.fill(deadline)? {
                debug!(
                    "{}: discarded {} bytes without seeing {}",
                    self.device,
                    consumed.len(),
                    sentinel
                );
                return Err(SessionError::Timeout {
                    waiting_for: sentinel.to_string(),
                    timeout,
                });
            }
        }
    }

    /// Write the whole payload, retrying short writes.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let write_timeout = self.options.write_timeout;
        let poll = self.options.poll_interval;
        let mut offset = 0;
        let mut last_progress = Instant::now();

        while offset < payload.len() {
            self.check_cancelled()?;
            if last_progress.elapsed() >= write_timeout {
                return Err(self.fault(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "write stalled after {} of {} bytes",
                        offset,
                        payload.len()
                    ),
                )));
            }

            let transport = self.transport.as_mut().ok_or(SessionError::Closed)?;
            match transport.write_bytes(&payload[offset..], poll) {
                Ok(0) => continue,
                Ok(n) => {
                    offset += n;
                    last_progress = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fault(e)),
            }
        }

        let flushed = match self.transport.as_mut() {
            Some(transport) => transport.flush(),
            None => return Err(SessionError::Closed),
        };
        flushed.map_err(|e| self.fault(e))?;

        debug!("{}: sent {} bytes", self.device, payload.len());
        Ok(())
    }

    /// Read the next delimiter-terminated record.
    ///
    /// On timeout, the bytes of the incomplete line stay buffered. A line
    /// that is not valid text is consumed and reported as
    /// [`SessionError::Encoding`].
    pub fn read_record(&mut self, timeout: Duration) -> Result<Record> {
        let deadline = deadline_after(timeout);
        loop {
            if let Some(line) = self.take_line() {
                return Record::decode(line, self.options.delimiter);
            }
            if !self.fill(deadline)? {
                return Err(self.record_timeout(timeout));
            }
        }
    }

    /// Read the next streaming event.
    ///
    /// `end` is recognised only at a record boundary: the bytes following
    /// the previous delimiter must begin with it. The sentinel is consumed;
    /// anything after it stays buffered.
    pub fn next_event(&mut self, end: &Sentinel, timeout: Duration) -> Result<StreamEvent> {
        let deadline = deadline_after(timeout);
        loop {
            if end.begins(self.pending.iter().copied()) {
                self.pending.drain(..end.len());
                debug!("{}: matched {}", self.device, end);
                return Ok(StreamEvent::End);
            }
            if let Some(line) = self.take_line() {
                return Record::decode(line, self.options.delimiter).map(StreamEvent::Record);
            }
            if !self.fill(deadline)? {
                return Err(self.record_timeout(timeout));
            }
        }
    }

    /// Release the transport. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                warn!("{}: error while closing: {}", self.device, e);
            }
            if !self.pending.is_empty() {
                debug!(
                    "{}: dropped {} unread bytes on close",
                    self.device,
                    self.pending.len()
                );
                self.pending.clear();
            }
            info!("session closed on {} ({})", self.device, self.state);
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let delimiter = self.options.delimiter;
        let end = self.pending.iter().position(|b| *b == delimiter)?;
        Some(self.pending.drain(..=end).collect())
    }

    fn record_timeout(&self, timeout: Duration) -> SessionError {
        SessionError::Timeout {
            waiting_for: format!("a record ({} bytes buffered)", self.pending.len()),
            timeout,
        }
    }

    /// Poll the transport until some bytes arrive or `deadline` passes.
    /// Without a deadline, polls until data, cancellation or an error.
    ///
    /// Returns `Ok(false)` on deadline.
    fn fill(&mut self, deadline: Option<Instant>) -> Result<bool> {
        loop {
            self.check_cancelled()?;

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    remaining.min(self.options.poll_interval)
                }
                None => self.options.poll_interval,
            };

            let transport = self.transport.as_mut().ok_or(SessionError::Closed)?;
            match transport.read_bytes(&mut self.scratch, wait) {
                Ok(0) => continue,
                Ok(n) => {
                    self.pending.extend(&self.scratch[..n]);
                    return Ok(true);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(self.fault(e)),
            }
        }
    }

    fn check_cancelled(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.transition(SessionState::Cancelled);
            return Err(SessionError::Cancelled);
        }
        if self.transport.is_none() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn fault(&mut self, e: io::Error) -> SessionError {
        warn!("{}: transport error: {}", self.device, e);
        self.transition(SessionState::Failed);
        SessionError::Transport(e)
    }
}

/// `None` when `timeout` is too large to be represented as an instant
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

impl<T: Transport> Drop for FramedSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::transport::ReplayTransport;

    const POLL: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(2);

    fn session(transport: ReplayTransport) -> FramedSession<ReplayTransport> {
        FramedSession::new(
            transport,
            SessionOptions::default().with_poll_interval(POLL),
            CancelToken::new(),
        )
    }

    #[test]
    fn test_await_sentinel_stops_after_last_byte() {
        for sentinel in ["ready", "transmitting", "done", "r"] {
            let stream = format!("xx{}rest of stream\n", sentinel);
            let mut s = session(ReplayTransport::from_bytes("test", stream.into_bytes()));

            let consumed = s.await_sentinel(&Sentinel::from(sentinel), WAIT).unwrap();
            assert_eq!(consumed, format!("xx{}", sentinel).into_bytes());

            let next = s.read_record(WAIT).unwrap();
            assert_eq!(next.text(), "rest of stream");
        }
    }

    #[test]
    fn test_await_sentinel_across_chunk_boundaries() {
        let transport = ReplayTransport::new("test")
            .data(b"noise..re".to_vec())
            .silence(Duration::from_millis(15))
            .data(b"adysample:1\n".to_vec())
            .with_chunk(3);
        let mut s = session(transport);

        let consumed = s.await_sentinel(&Sentinel::ready(), WAIT).unwrap();
        assert_eq!(consumed, b"noise..ready");
        assert_eq!(s.read_record(WAIT).unwrap().text(), "sample:1");
    }

    #[test]
    fn test_await_sentinel_times_out_without_match() {
        let transport = ReplayTransport::from_bytes("test", b"read rea dy ready".to_vec());
        let mut s = session(transport);
        let timeout = Duration::from_millis(60);

        let started = Instant::now();
        let err = s.await_sentinel(&Sentinel::done(), timeout).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {}", err);
        assert!(started.elapsed() >= timeout);

        // Timeouts are recoverable: the session stays open
        assert_eq!(s.state(), SessionState::Idle);
        assert!(!s.is_closed());
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn test_records_read_back_in_order() {
        let lines: Vec<String> = (0..25).map(|i| format!("sample:{}", i)).collect();
        let mut stream = Vec::new();
        for line in &lines {
            stream.extend_from_slice(line.as_bytes());
            stream.push(b'\n');
        }
        let mut s = session(ReplayTransport::from_bytes("test", stream).with_chunk(7));

        for line in &lines {
            assert_eq!(s.read_record(WAIT).unwrap().text(), line);
        }
        assert!(s.read_record(Duration::from_millis(30)).unwrap_err().is_timeout());
    }

    #[test]
    fn test_record_timeout_keeps_partial_line() {
        let transport = ReplayTransport::new("test")
            .data(b"sample:4".to_vec())
            .silence(Duration::from_millis(80))
            .data(b"2\n".to_vec());
        let mut s = session(transport);

        let err = s.read_record(Duration::from_millis(30)).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(s.buffered(), 8);

        assert_eq!(s.read_record(WAIT).unwrap().text(), "sample:42");
    }

    #[test]
    fn test_unbounded_timeout_waits_for_data() {
        let transport = ReplayTransport::new("test")
            .silence(Duration::from_millis(30))
            .data(b"sample:1\nready".to_vec());
        let mut s = session(transport);

        assert_eq!(s.read_record(Duration::MAX).unwrap().text(), "sample:1");
        let consumed = s.await_sentinel(&Sentinel::ready(), Duration::MAX).unwrap();
        assert_eq!(consumed, b"ready");
    }

    #[test]
    fn test_unbounded_timeout_still_honours_cancel() {
        let cancel = CancelToken::new();
        let mut s = FramedSession::new(
            ReplayTransport::new("test"),
            SessionOptions::default().with_poll_interval(POLL),
            cancel.clone(),
        );

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            cancel.cancel();
        });
        let err = s.next_event(&Sentinel::done(), Duration::MAX).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(s.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_invalid_text_skips_one_record() {
        let transport =
            ReplayTransport::from_bytes("test", b"\xff\xfe not text\ntimestamp:5\n".to_vec());
        let mut s = session(transport);

        let err = s.read_record(WAIT).unwrap_err();
        assert!(matches!(err, SessionError::Encoding(_)));

        let next = s.read_record(WAIT).unwrap();
        assert_eq!(next.text(), "timestamp:5");
        assert_eq!(next.kind(), RecordKind::Timestamp);
    }

    #[test]
    fn test_cancel_interrupts_blocked_read() {
        let cancel = CancelToken::new();
        let transport = ReplayTransport::new("test");
        let probe = transport.probe();
        let mut s = FramedSession::new(
            transport,
            SessionOptions::default().with_poll_interval(POLL),
            cancel.clone(),
        );

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let started = Instant::now();
        let err = s.read_record(Duration::from_secs(10)).unwrap_err();
        let elapsed = started.elapsed();
        canceller.join().unwrap();

        assert!(matches!(err, SessionError::Cancelled));
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
        assert_eq!(s.state(), SessionState::Cancelled);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_transport_fault_fails_and_closes() {
        let transport = ReplayTransport::new("test")
            .data(b"noise".to_vec())
            .fault(io::ErrorKind::BrokenPipe);
        let probe = transport.probe();
        let mut s = session(transport);

        let err = s.await_sentinel(&Sentinel::ready(), WAIT).unwrap_err();
        assert!(err.is_transport());
        assert_eq!(s.state(), SessionState::Failed);
        assert!(s.is_closed());
        assert_eq!(probe.closes(), 1);

        assert!(matches!(s.read_record(WAIT), Err(SessionError::Closed)));
    }

    #[test]
    fn test_send_retries_short_writes() {
        let transport = ReplayTransport::new("test").with_max_write(3);
        let probe = transport.probe();
        let mut s = session(transport);

        s.send(b"trigger-payload").unwrap();
        assert_eq!(probe.written(), b"trigger-payload");
    }

    #[test]
    fn test_send_stalled_write_is_transport_error() {
        let transport = ReplayTransport::new("test").with_max_write(0);
        let mut s = FramedSession::new(
            transport,
            SessionOptions {
                poll_interval: POLL,
                write_timeout: Duration::from_millis(20),
                delimiter: b'\n',
            },
            CancelToken::new(),
        );

        let err = s.send(b"g").unwrap_err();
        assert!(err.is_transport());
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let transport = ReplayTransport::new("test");
        let probe = transport.probe();
        let mut s = session(transport);

        s.close();
        s.close();
        assert!(s.is_closed());
        assert!(matches!(s.send(b"g"), Err(SessionError::Closed)));
        drop(s);

        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_drop_closes_open_session() {
        let transport = ReplayTransport::new("test");
        let probe = transport.probe();
        drop(session(transport));
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let transport = ReplayTransport::new("test");
        let probe = transport.probe();
        let mut s = session(transport);

        s.transition(SessionState::AwaitingReady);
        s.transition(SessionState::Done);
        s.transition(SessionState::Failed);
        s.transition(SessionState::Streaming);

        assert_eq!(s.state(), SessionState::Done);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_next_event_detects_end_at_record_boundary() {
        let transport =
            ReplayTransport::from_bytes("test", b"sample:done\ntimestamp:1\ndone".to_vec());
        let mut s = session(transport);
        let end = Sentinel::done();

        let first = s.next_event(&end, WAIT).unwrap();
        assert_eq!(first, StreamEvent::Record(Record::new("sample:done")));
        let second = s.next_event(&end, WAIT).unwrap();
        assert_eq!(second, StreamEvent::Record(Record::new("timestamp:1")));
        assert_eq!(s.next_event(&end, WAIT).unwrap(), StreamEvent::End);
    }

    #[test]
    fn test_next_event_waits_for_split_end_sentinel() {
        let transport = ReplayTransport::new("test")
            .data(b"do".to_vec())
            .silence(Duration::from_millis(20))
            .data(b"ne\r\n".to_vec());
        let mut s = session(transport);

        assert_eq!(s.next_event(&Sentinel::done(), WAIT).unwrap(), StreamEvent::End);
        assert_eq!(s.buffered(), 2);
    }
}

//! Scripted transport
//!
//! Plays back a fixed script of byte chunks, silences and faults. Used to run
//! the acquisition protocol against a captured byte log and to exercise the
//! session without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::Transport;

/// Maximum bytes handed out by a single read unless configured otherwise
const DEFAULT_CHUNK: usize = 64;

/// One scripted event
#[derive(Debug, Clone)]
pub enum Step {
    /// Bytes that become readable
    Data(Vec<u8>),
    /// Nothing arrives for this long
    Silence(Duration),
    /// The next read fails with this error kind
    Fault(io::ErrorKind),
}

/// Observes a replay transport after it has been moved into a session
#[derive(Debug, Clone, Default)]
pub struct ReplayProbe {
    written: Arc<Mutex<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
}

impl ReplayProbe {
    /// All bytes the session wrote so far
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Number of times the transport was closed
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// In-memory transport replaying a script
#[derive(Debug)]
pub struct ReplayTransport {
    name: String,
    script: VecDeque<Step>,
    chunk: usize,
    max_write: usize,
    disconnect_at_end: bool,
    probe: ReplayProbe,
}

impl ReplayTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: VecDeque::new(),
            chunk: DEFAULT_CHUNK,
            max_write: usize::MAX,
            disconnect_at_end: false,
            probe: ReplayProbe::default(),
        }
    }

    /// Replay a whole capture as one readable stream.
    pub fn from_bytes(name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(name).data(bytes)
    }

    pub fn data(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.script.push_back(Step::Data(bytes.into()));
        self
    }

    pub fn silence(mut self, duration: Duration) -> Self {
        self.script.push_back(Step::Silence(duration));
        self
    }

    pub fn fault(mut self, kind: io::ErrorKind) -> Self {
        self.script.push_back(Step::Fault(kind));
        self
    }

    /// Cap the bytes returned per read
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Cap the bytes accepted per write, forcing short writes
    pub fn with_max_write(mut self, max_write: usize) -> Self {
        self.max_write = max_write;
        self
    }

    /// Fail reads with `UnexpectedEof` once the script is exhausted instead
    /// of staying silent forever
    pub fn disconnect_at_end(mut self) -> Self {
        self.disconnect_at_end = true;
        self
    }

    pub fn probe(&self) -> ReplayProbe {
        self.probe.clone()
    }
}

impl Transport for ReplayTransport {
    fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        match self.script.pop_front() {
            Some(Step::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len()).min(self.chunk);
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.script.push_front(Step::Data(bytes.split_off(n)));
                }
                Ok(n)
            }
            Some(Step::Silence(remaining)) => {
                let wait = remaining.min(timeout);
                std::thread::sleep(wait);
                if remaining > wait {
                    self.script.push_front(Step::Silence(remaining - wait));
                }
                Ok(0)
            }
            Some(Step::Fault(kind)) => Err(io::Error::new(kind, "scripted transport fault")),
            None if self.disconnect_at_end => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of capture",
            )),
            None => {
                std::thread::sleep(timeout);
                Ok(0)
            }
        }
    }

    fn write_bytes(&mut self, data: &[u8], _timeout: Duration) -> io::Result<usize> {
        let n = data.len().min(self.max_write);
        let mut written = self
            .probe
            .written
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "write log poisoned"))?;
        written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

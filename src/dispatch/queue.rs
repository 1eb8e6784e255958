//! Bounded record hand-off between the session thread and a consumer
//!
//! Records leave the queue in arrival order. When the queue is full the
//! producer either blocks until the consumer catches up or evicts the oldest
//! queued record, depending on the [`OverflowPolicy`].

use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::RecordSink;
use crate::cancel::CancelToken;
use crate::error::{Result, SessionError};
use crate::record::Record;

/// Default number of records held before the overflow policy applies
pub const DEFAULT_CAPACITY: usize = 1024;

/// How often a blocked producer re-checks cancellation
const BLOCK_POLL: Duration = Duration::from_millis(50);

/// What the producer does when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait for the consumer
    #[default]
    Block,
    /// Evict the oldest queued record
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Block => write!(f, "block"),
            OverflowPolicy::DropOldest => write!(f, "drop-oldest"),
        }
    }
}

#[derive(Default)]
struct Counters {
    dropped: AtomicUsize,
    consumer_gone: AtomicBool,
}

/// Create a bounded queue holding at most `capacity` records.
pub fn bounded(capacity: usize, policy: OverflowPolicy) -> (QueueSink, RecordReceiver) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    let counters = Arc::new(Counters::default());

    // Evicting needs a handle on the receiving end
    let evict = match policy {
        OverflowPolicy::DropOldest => Some(rx.clone()),
        OverflowPolicy::Block => None,
    };

    (
        QueueSink {
            tx: Some(tx),
            evict,
            counters: Arc::clone(&counters),
            cancel: None,
        },
        RecordReceiver { rx, counters },
    )
}

/// Producer half, used as the sink of an acquisition run
pub struct QueueSink {
    tx: Option<Sender<Record>>,
    evict: Option<Receiver<Record>>,
    counters: Arc<Counters>,
    cancel: Option<CancelToken>,
}

impl QueueSink {
    /// Abort a blocked `accept` with `Cancelled` once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    fn send_blocking(&self, tx: &Sender<Record>, mut record: Record) -> Result<()> {
        loop {
            if self.cancelled() {
                return Err(SessionError::Cancelled);
            }
            match tx.send_timeout(record, BLOCK_POLL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(r)) => record = r,
                Err(SendTimeoutError::Disconnected(_)) => return Err(consumer_gone()),
            }
        }
    }

    fn send_evicting(
        &self,
        tx: &Sender<Record>,
        evict: &Receiver<Record>,
        mut record: Record,
    ) -> Result<()> {
        loop {
            match tx.try_send(record) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(r)) => {
                    record = r;
                    // The consumer may have taken it first; then just retry
                    if evict.try_recv().is_ok() {
                        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped == 1 || dropped % 100 == 0 {
                            log::warn!("record queue full, {} records dropped", dropped);
                        }
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(consumer_gone()),
            }
        }
    }
}

impl RecordSink for QueueSink {
    fn accept(&mut self, record: Record) -> Result<()> {
        if self.counters.consumer_gone.load(Ordering::Acquire) {
            return Err(consumer_gone());
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SessionError::Dispatch("record queue is closed".to_string()))?;

        match &self.evict {
            Some(evict) => self.send_evicting(tx, evict, record),
            None => self.send_blocking(tx, record),
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

fn consumer_gone() -> SessionError {
    SessionError::Dispatch("record consumer has gone away".to_string())
}

/// Consumer half
pub struct RecordReceiver {
    rx: Receiver<Record>,
    counters: Arc<Counters>,
}

impl RecordReceiver {
    /// Wait for the next record. `None` once the producer is closed and the
    /// queue is drained.
    pub fn recv(&self) -> Option<Record> {
        self.rx.recv().ok()
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Record> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Records evicted under [`OverflowPolicy::DropOldest`]
    pub fn dropped(&self) -> usize {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Iterator for RecordReceiver {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.recv()
    }
}

impl Drop for RecordReceiver {
    fn drop(&mut self) {
        self.counters.consumer_gone.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn record(i: usize) -> Record {
        Record::new(format!("sample:{}", i))
    }

    #[test]
    fn test_records_arrive_in_order_across_threads() {
        let (mut sink, receiver) = bounded(4, OverflowPolicy::Block);

        let consumer = thread::spawn(move || receiver.collect::<Vec<Record>>());
        for i in 0..100 {
            sink.accept(record(i)).unwrap();
        }
        sink.finish().unwrap();

        let received = consumer.join().unwrap();
        assert_eq!(received, (0..100).map(record).collect::<Vec<_>>());
    }

    #[test]
    fn test_block_policy_waits_for_consumer() {
        let (mut sink, receiver) = bounded(1, OverflowPolicy::Block);
        sink.accept(record(0)).unwrap();

        let producer = thread::spawn(move || {
            let started = Instant::now();
            sink.accept(record(1)).unwrap();
            started.elapsed()
        });

        thread::sleep(Duration::from_millis(80));
        assert_eq!(receiver.recv(), Some(record(0)));
        let blocked_for = producer.join().unwrap();

        assert!(blocked_for >= Duration::from_millis(50), "{:?}", blocked_for);
        assert_eq!(receiver.recv(), Some(record(1)));
        // producer dropped: channel ends
        assert_eq!(receiver.recv(), None);
        assert_eq!(receiver.dropped(), 0);
    }

    #[test]
    fn test_drop_oldest_keeps_newest_records() {
        let (mut sink, receiver) = bounded(3, OverflowPolicy::DropOldest);
        for i in 0..10 {
            sink.accept(record(i)).unwrap();
        }
        drop(sink);

        assert_eq!(receiver.dropped(), 7);
        let kept: Vec<Record> = receiver.collect();
        assert_eq!(kept, vec![record(7), record(8), record(9)]);
    }

    #[test]
    fn test_blocked_producer_honours_cancel() {
        let cancel = CancelToken::new();
        let (sink, _receiver) = bounded(1, OverflowPolicy::Block);
        let mut sink = sink.with_cancel(cancel.clone());
        sink.accept(record(0)).unwrap();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.cancel();
        });
        let err = sink.accept(record(1)).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, SessionError::Cancelled));
    }

    #[test]
    fn test_accept_fails_once_consumer_is_gone() {
        let (mut sink, receiver) = bounded(8, OverflowPolicy::Block);
        drop(receiver);

        let err = sink.accept(record(0)).unwrap_err();
        assert!(matches!(err, SessionError::Dispatch(_)));
    }

    #[test]
    fn test_drop_oldest_fails_once_consumer_is_gone() {
        let (mut sink, receiver) = bounded(2, OverflowPolicy::DropOldest);
        sink.accept(record(0)).unwrap();
        drop(receiver);

        let err = sink.accept(record(1)).unwrap_err();
        assert!(matches!(err, SessionError::Dispatch(_)));
    }

    #[test]
    fn test_accept_after_finish_is_rejected() {
        let (mut sink, receiver) = bounded(2, OverflowPolicy::Block);
        sink.accept(record(0)).unwrap();
        sink.finish().unwrap();

        assert!(matches!(sink.accept(record(1)), Err(SessionError::Dispatch(_))));
        assert_eq!(receiver.collect::<Vec<_>>(), vec![record(0)]);
    }

    #[test]
    fn test_recv_timeout_on_idle_queue() {
        let (_sink, receiver) = bounded(8, OverflowPolicy::Block);
        let started = Instant::now();
        assert_eq!(receiver.recv_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(OverflowPolicy::DropOldest.to_string(), "drop-oldest");
        assert_eq!(OverflowPolicy::default(), OverflowPolicy::Block);
    }
}

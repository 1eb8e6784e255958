//! Record sinks
//!
//! The acquisition driver hands every classified `sample`/`timestamp` record
//! to a [`RecordSink`] in arrival order. Sinks provided here:
//!
//! - [`ConsoleSink`]: coloured terminal output with optional timestamps
//! - [`LogFileSink`]: timestamped log file, flushed per record
//! - [`Fanout`]: forwards each record to several sinks
//! - [`QueueSink`]: bounded hand-off to a consumer thread

pub mod queue;

pub use queue::{bounded, OverflowPolicy, QueueSink, RecordReceiver};

use colored::Colorize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::{Result, SessionError};
use crate::record::{Record, RecordKind};

/// Downstream consumer of classified records
pub trait RecordSink {
    fn accept(&mut self, record: Record) -> Result<()>;

    /// Called once after the last record of a successful run
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn accept(&mut self, record: Record) -> Result<()> {
        (**self).accept(record)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Collects records in memory
impl RecordSink for Vec<Record> {
    fn accept(&mut self, record: Record) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Prints records to stdout
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    show_timestamps: bool,
}

impl ConsoleSink {
    pub fn new(show_timestamps: bool) -> Self {
        Self { show_timestamps }
    }

    /// Format a record for display, stamped with its arrival time
    pub fn format(&self, record: &Record) -> String {
        let mut output = String::new();

        if self.show_timestamps {
            let timestamp = record.received_at().format("%H:%M:%S%.3f");
            output.push_str(&format!("{} ", timestamp.to_string().dimmed()));
        }

        match record.kind() {
            RecordKind::Sample => output.push_str(record.text()),
            RecordKind::Timestamp => output.push_str(&record.text().cyan().to_string()),
            RecordKind::Unrecognized => output.push_str(&record.text().dimmed().to_string()),
        }

        output
    }
}

impl RecordSink for ConsoleSink {
    fn accept(&mut self, record: Record) -> Result<()> {
        println!("{}", self.format(&record));
        Ok(())
    }
}

/// Appends records to a file, stamped with their arrival time
pub struct LogFileSink {
    writer: BufWriter<File>,
}

impl LogFileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl RecordSink for LogFileSink {
    fn accept(&mut self, record: Record) -> Result<()> {
        let timestamp = record.received_at().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(self.writer, "[{}] {}", timestamp, record.text()).map_err(log_error)?;
        self.writer.flush().map_err(log_error)
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().map_err(log_error)
    }
}

fn log_error(e: io::Error) -> SessionError {
    SessionError::Dispatch(format!("log file: {}", e))
}

/// Forwards every record to each inner sink in order
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn RecordSink + Send>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl RecordSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl RecordSink for Fanout {
    fn accept(&mut self, record: Record) -> Result<()> {
        if let Some((last, rest)) = self.sinks.split_last_mut() {
            for sink in rest {
                sink.accept(record.clone())?;
            }
            last.accept(record)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Sink shared with the test after being boxed
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<Record>>>);

    impl RecordSink for Shared {
        fn accept(&mut self, record: Record) -> Result<()> {
            self.0.lock().unwrap().push(record);
            Ok(())
        }
    }

    #[test]
    fn test_log_file_sink_writes_timestamped_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.log");

        let mut sink = LogFileSink::create(&path).unwrap();
        sink.accept(Record::new("sample:1")).unwrap();
        sink.accept(Record::new("timestamp:100")).unwrap();
        sink.finish().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] sample:1"));
        assert!(lines[1].ends_with("] timestamp:100"));
    }

    #[test]
    fn test_log_file_sink_fails_for_missing_directory() {
        let dir = tempdir().unwrap();
        assert!(LogFileSink::create(&dir.path().join("missing").join("x.log")).is_err());
    }

    #[test]
    fn test_fanout_preserves_order_for_every_sink() {
        let first = Shared::default();
        let second = Shared::default();
        let mut fanout = Fanout::new().with(first.clone()).with(second.clone());

        for text in ["sample:1", "sample:2", "timestamp:3"] {
            fanout.accept(Record::new(text)).unwrap();
        }
        fanout.finish().unwrap();

        let expected: Vec<Record> = ["sample:1", "sample:2", "timestamp:3"]
            .into_iter()
            .map(Record::new)
            .collect();
        assert_eq!(*first.0.lock().unwrap(), expected);
        assert_eq!(*second.0.lock().unwrap(), expected);
    }

    #[test]
    fn test_console_timestamp_is_arrival_time() {
        colored::control::set_override(false);
        let record = Record::new("sample:3");
        let arrived = record.received_at().format("%H:%M:%S%.3f").to_string();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let line = ConsoleSink::new(true).format(&record);
        assert_eq!(line, format!("{} sample:3", arrived));
    }

    #[test]
    fn test_console_format_without_timestamp() {
        colored::control::set_override(false);
        let sink = ConsoleSink::new(false);
        assert_eq!(sink.format(&Record::new("sample:9")), "sample:9");
        assert_eq!(sink.format(&Record::new("timestamp:9")), "timestamp:9");
    }
}

use super::format::OutputFormat;
use crate::aggregator::TimestampedStat;
use crate::error::DeliveryError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Final stage of the pipeline: turns stats into bytes and ships them.
///
/// Sinks run on a blocking thread, one per sink, so `deliver` may block.
pub trait Sink: Send + 'static {
    fn name(&self) -> &str;

    fn encode(&self, stat: &TimestampedStat) -> Result<Bytes, DeliveryError>;

    fn deliver(&mut self, encoded: Bytes) -> Result<(), DeliveryError>;

    /// Flush and release resources once the subscription has closed.
    fn close(&mut self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Appends encoded stats to a file.
pub struct FileSink {
    name: String,
    path: PathBuf,
    format: OutputFormat,
    file: File,
}

impl FileSink {
    pub fn open(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        format: OutputFormat,
    ) -> Result<Self, DeliveryError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(FileSink {
            name: name.into(),
            path,
            format,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, stat: &TimestampedStat) -> Result<Bytes, DeliveryError> {
        self.format.encode(stat)
    }

    fn deliver(&mut self, encoded: Bytes) -> Result<(), DeliveryError> {
        self.file.write_all(&encoded)?;
        self.file.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeliveryError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Emits one log event per stat under the `vpp_agent::stats` target, so the
/// subscriber configuration decides where they end up.
pub struct LogSink {
    name: String,
    format: OutputFormat,
}

impl LogSink {
    pub fn new(name: impl Into<String>, format: OutputFormat) -> Self {
        LogSink {
            name: name.into(),
            format,
        }
    }
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, stat: &TimestampedStat) -> Result<Bytes, DeliveryError> {
        self.format.encode(stat)
    }

    fn deliver(&mut self, encoded: Bytes) -> Result<(), DeliveryError> {
        let line = std::str::from_utf8(&encoded)
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        info!(target: "vpp_agent::stats", sink = %self.name, update = line.trim_end(), "Update detected");
        Ok(())
    }
}

/// Collects delivered lines in memory. Cloned handles share the buffer, and
/// deliveries can be scripted to fail.
#[derive(Clone)]
pub struct MemorySink {
    name: String,
    format: OutputFormat,
    state: Arc<Mutex<MemorySinkState>>,
}

#[derive(Default)]
struct MemorySinkState {
    delivered: Vec<Bytes>,
    fail_next: u32,
    closed: bool,
}

impl MemorySink {
    pub fn new(name: impl Into<String>, format: OutputFormat) -> Self {
        MemorySink {
            name: name.into(),
            format,
            state: Arc::new(Mutex::new(MemorySinkState::default())),
        }
    }

    /// Fail the next `count` deliveries.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    pub fn delivered(&self) -> Vec<Bytes> {
        self.state.lock().delivered.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, stat: &TimestampedStat) -> Result<Bytes, DeliveryError> {
        self.format.encode(stat)
    }

    fn deliver(&mut self, encoded: Bytes) -> Result<(), DeliveryError> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DeliveryError::Rejected("scripted failure".to_string()));
        }
        state.delivered.push(encoded);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeliveryError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

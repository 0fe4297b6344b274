//! Log sinks.
//!
//! A sink is write-only from the bridge's point of view. `emit` must never
//! block for long and must never fail; sinks that cannot accept a record drop
//! it and count the drop.

use crate::record::{LogRecord, Severity};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Destination for structured log records
pub trait LogSink: Send + Sync {
    /// Append a record. Never blocks indefinitely, never fails.
    fn emit(&self, record: LogRecord);
}

/// Discards every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, _record: LogRecord) {}
}

/// Bounded in-memory buffer; the oldest record is dropped when full
#[derive(Debug)]
pub struct MemorySink {
    records: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl MemorySink {
    /// Create a sink holding at most `capacity` records
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Copy of the buffered records, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        match self.records.lock() {
            Ok(records) => records.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Buffered records with a given event name
    #[must_use]
    pub fn records_named(&self, event: &str) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.event == event)
            .collect()
    }

    /// Number of buffered records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records evicted because the buffer was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Remove and return all buffered records
    pub fn drain(&self) -> Vec<LogRecord> {
        match self.records.lock() {
            Ok(mut records) => records.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: LogRecord) {
        let Ok(mut records) = self.records.lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if records.len() >= self.capacity {
            records.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
    }
}

/// Forwards records into the process's `tracing` output
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: LogRecord) {
        let fields = serde_json::Value::Object(record.fields.into_iter().collect()).to_string();
        match record.severity {
            Severity::Debug => tracing::debug!(
                target: "sluice::script",
                event = %record.event, trans_id = %record.trans_id, op = %record.op, %fields
            ),
            Severity::Info => tracing::info!(
                target: "sluice::script",
                event = %record.event, trans_id = %record.trans_id, op = %record.op, %fields
            ),
            Severity::Warn => tracing::warn!(
                target: "sluice::script",
                event = %record.event, trans_id = %record.trans_id, op = %record.op, %fields
            ),
            Severity::Error | Severity::Security => tracing::error!(
                target: "sluice::script",
                severity = record.severity.as_str(),
                event = %record.event, trans_id = %record.trans_id, op = %record.op, %fields
            ),
        }
    }
}

/// Hands records to an off-box shipper through a bounded channel
///
/// Uses `try_send`, so a slow or stopped consumer costs dropped records,
/// never a stalled request.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<LogRecord>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiver the shipper drains
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Records dropped because the channel was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl LogSink for ChannelSink {
    fn emit(&self, record: LogRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

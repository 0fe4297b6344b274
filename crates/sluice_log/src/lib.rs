//! SLUICE Structured Log
//!
//! Records emitted by scripts and by the bridge, and the sinks that carry
//! them off the request path without blocking it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod record;
pub mod sink;

pub use record::{LogRecord, RecordSource, Severity};
pub use sink::{ChannelSink, LogSink, MemorySink, NullSink, TracingSink};

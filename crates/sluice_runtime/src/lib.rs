//! SLUICE Runtime
//!
//! The execution engine and the host bridge the gateway calls at each hook
//! point, with configuration, failure policy, metrics, and tracing setup.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod engine;
pub mod monitor;
pub mod status;
pub mod telemetry;

pub use bridge::{BridgeError, HostBridge, Invocation, InvocationState};
pub use config::BridgeConfig;
pub use engine::{ExecutionEngine, ExecutionOutcome, RunStats, RuntimeError};
pub use monitor::{BridgeMetrics, Metrics};
pub use status::{FailureMode, FailurePolicy, StatusCategory};
pub use telemetry::{LogFormat, init_tracing, init_tracing_with};

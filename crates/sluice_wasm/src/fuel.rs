//! Fuel and wall-clock budgets for script execution.
//!
//! Two independent bounds apply to every run: an instruction budget metered
//! by wasmtime fuel, and a wall-clock budget enforced by epoch interruption.
//! Host calls are charged fuel too and check the wall clock on entry, so a
//! script cannot escape either bound by spending its time in the host.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use wasmtime::Engine;

/// Which budget a run exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    /// Instruction budget
    Fuel,
    /// Wall-clock budget
    WallClock,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fuel => write!(f, "fuel"),
            Self::WallClock => write!(f, "wall-clock"),
        }
    }
}

/// Longest accepted epoch tick; stopping the ticker waits up to one tick
pub const MAX_EPOCH_TICK: Duration = Duration::from_secs(1);

/// Budgets applied to one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionBudget {
    /// Fuel units granted to the run
    pub fuel: u64,
    /// Wall-clock bound
    pub wall_clock: Duration,
    /// Epoch tick interval of the owning runtime
    pub epoch_tick: Duration,
}

impl ExecutionBudget {
    /// Create a budget
    #[must_use]
    pub fn new(fuel: u64, wall_clock: Duration, epoch_tick: Duration) -> Self {
        Self {
            fuel,
            wall_clock,
            epoch_tick,
        }
    }

    /// Epoch ticks until the wall-clock deadline, rounded up, at least one
    #[must_use]
    pub fn epoch_ticks(&self) -> u64 {
        let interval_ms = self.epoch_tick.as_millis().max(1);
        let timeout_ms = self.wall_clock.as_millis().max(1);
        timeout_ms.div_ceil(interval_ms) as u64
    }

    /// Absolute deadline for a run starting at `start`
    #[must_use]
    pub fn deadline_from(&self, start: Instant) -> Instant {
        start + self.wall_clock
    }

    /// Validate the budget
    ///
    /// # Errors
    ///
    /// Returns error if any bound is zero or the epoch tick exceeds
    /// [`MAX_EPOCH_TICK`]
    pub fn validate(&self) -> Result<(), FuelError> {
        if self.fuel == 0 {
            return Err(FuelError::InvalidAmount("fuel budget must be > 0".into()));
        }
        if self.wall_clock.is_zero() {
            return Err(FuelError::InvalidAmount(
                "wall-clock budget must be > 0".into(),
            ));
        }
        if self.epoch_tick.is_zero() {
            return Err(FuelError::InvalidAmount(
                "epoch tick interval must be > 0".into(),
            ));
        }
        if self.epoch_tick > MAX_EPOCH_TICK {
            return Err(FuelError::InvalidAmount(format!(
                "epoch tick interval must be <= {}ms",
                MAX_EPOCH_TICK.as_millis()
            )));
        }
        Ok(())
    }
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self::new(
            10_000_000,
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
    }
}

/// Resources one run actually used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetUsage {
    /// Fuel consumed, host call charges included
    pub fuel_consumed: u64,
    /// Fuel granted
    pub fuel_budget: u64,
    /// Wall-clock time spent in the run
    pub elapsed: Duration,
    /// Peak linear memory in bytes
    pub peak_memory_bytes: u64,
}

impl BudgetUsage {
    /// Get fuel usage as a percentage
    #[must_use]
    pub fn usage_percent(&self) -> f64 {
        if self.fuel_budget == 0 {
            return 0.0;
        }
        (self.fuel_consumed as f64 / self.fuel_budget as f64) * 100.0
    }
}

/// Fuel-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FuelError {
    /// Out of fuel inside a host call
    #[error("Out of fuel: requested {requested}, remaining {remaining}")]
    OutOfFuel {
        /// Fuel the call costs
        requested: u64,
        /// Fuel left
        remaining: u64,
    },

    /// Invalid budget
    #[error("Invalid fuel amount: {0}")]
    InvalidAmount(String),

    /// The store refused a fuel adjustment
    #[error("fuel metering failed: {0}")]
    Metering(String),
}

/// Background thread advancing an engine's epoch at a fixed interval
///
/// Stores armed with `set_epoch_deadline(n)` trap after `n` ticks. The thread
/// stops when the ticker is dropped.
#[derive(Debug)]
pub struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl EpochTicker {
    /// Start ticking `engine` every `interval`
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn start(engine: Engine, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("sluice-epoch-ticker".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
            interval,
        })
    }

    /// Tick interval
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

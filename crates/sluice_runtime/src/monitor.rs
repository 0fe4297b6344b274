//! Bridge metrics.
//!
//! Counters are plain atomics so concurrent `execute` calls can record
//! without a lock; [`BridgeMetrics::snapshot`] reads them into a
//! serializable [`Metrics`] value.

use serde::Serialize;
use sluice_wasm::CacheStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::engine::RunStats;
use crate::status::StatusCategory;

/// Point-in-time metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    /// Invocations seen
    pub executions: u64,
    /// Committed runs
    pub successes: u64,
    /// Compile failures
    pub compile_errors: u64,
    /// Traps and script-raised failures
    pub runtime_errors: u64,
    /// Budget exhaustions
    pub timeouts: u64,
    /// Memory limit hits during a run
    pub memory_limits: u64,
    /// Binding surface violations
    pub binding_violations: u64,
    /// Sandbox setup failures
    pub resource_init_errors: u64,
    /// Malformed op names
    pub invalid_hooks: u64,
    /// Fuel burned across all runs
    pub fuel_consumed: u64,
    /// Host calls across all runs
    pub host_calls: u64,
    /// Compilation cache counters
    pub cache: CacheStats,
    /// Time since the metrics were created
    pub uptime: Duration,
}

impl Metrics {
    /// Count for one category
    #[must_use]
    pub fn count(&self, category: StatusCategory) -> u64 {
        match category {
            StatusCategory::Success => self.successes,
            StatusCategory::CompileError => self.compile_errors,
            StatusCategory::RuntimeError => self.runtime_errors,
            StatusCategory::Timeout => self.timeouts,
            StatusCategory::MemoryLimit => self.memory_limits,
            StatusCategory::BindingViolation => self.binding_violations,
            StatusCategory::ResourceInit => self.resource_init_errors,
            StatusCategory::InvalidHook => self.invalid_hooks,
        }
    }

    /// Failed invocations, all categories
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.executions.saturating_sub(self.successes)
    }

    /// Get success rate (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            return 1.0;
        }
        self.successes as f64 / self.executions as f64
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.failures() as f64 / self.executions as f64
    }
}

/// Lock-free counters shared by every invocation
#[derive(Debug)]
pub struct BridgeMetrics {
    counts: [AtomicU64; StatusCategory::ALL.len()],
    fuel_consumed: AtomicU64,
    host_calls: AtomicU64,
    started: Instant,
}

impl BridgeMetrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: Default::default(),
            fuel_consumed: AtomicU64::new(0),
            host_calls: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Count one invocation ending in `category`
    pub fn record(&self, category: StatusCategory) {
        self.counts[slot(category)].fetch_add(1, Ordering::Relaxed);
    }

    /// Add a run's resource use
    pub fn record_run(&self, stats: &RunStats) {
        self.fuel_consumed
            .fetch_add(stats.budget.fuel_consumed, Ordering::Relaxed);
        self.host_calls
            .fetch_add(u64::from(stats.bindings.host_calls), Ordering::Relaxed);
    }

    /// Current count for one category
    #[must_use]
    pub fn count(&self, category: StatusCategory) -> u64 {
        self.counts[slot(category)].load(Ordering::Relaxed)
    }

    /// Read every counter
    #[must_use]
    pub fn snapshot(&self, cache: CacheStats) -> Metrics {
        let executions = StatusCategory::ALL.iter().map(|c| self.count(*c)).sum();
        Metrics {
            executions,
            successes: self.count(StatusCategory::Success),
            compile_errors: self.count(StatusCategory::CompileError),
            runtime_errors: self.count(StatusCategory::RuntimeError),
            timeouts: self.count(StatusCategory::Timeout),
            memory_limits: self.count(StatusCategory::MemoryLimit),
            binding_violations: self.count(StatusCategory::BindingViolation),
            resource_init_errors: self.count(StatusCategory::ResourceInit),
            invalid_hooks: self.count(StatusCategory::InvalidHook),
            fuel_consumed: self.fuel_consumed.load(Ordering::Relaxed),
            host_calls: self.host_calls.load(Ordering::Relaxed),
            cache,
            uptime: self.started.elapsed(),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.fuel_consumed.store(0, Ordering::Relaxed);
        self.host_calls.store(0, Ordering::Relaxed);
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Categories are declared in `ALL` order
fn slot(category: StatusCategory) -> usize {
    category as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = BridgeMetrics::new().snapshot(CacheStats::default());
        assert_eq!(metrics.executions, 0);
        assert_eq!(metrics.success_rate(), 1.0);
        assert_eq!(metrics.failure_rate(), 0.0);
    }

    #[test]
    fn test_metrics_record() {
        let metrics = BridgeMetrics::new();
        metrics.record(StatusCategory::Success);
        metrics.record(StatusCategory::Success);
        metrics.record(StatusCategory::Timeout);
        metrics.record(StatusCategory::BindingViolation);

        let snap = metrics.snapshot(CacheStats::default());
        assert_eq!(snap.executions, 4);
        assert_eq!(snap.successes, 2);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.count(StatusCategory::BindingViolation), 1);
        assert_eq!(snap.failures(), 2);
        assert_eq!(snap.failure_rate(), 0.5);
    }

    #[test]
    fn test_metrics_record_run() {
        let metrics = BridgeMetrics::new();
        let mut stats = RunStats::default();
        stats.budget.fuel_consumed = 120;
        stats.bindings.host_calls = 3;
        metrics.record_run(&stats);
        metrics.record_run(&stats);

        let snap = metrics.snapshot(CacheStats::default());
        assert_eq!(snap.fuel_consumed, 240);
        assert_eq!(snap.host_calls, 6);
    }

    #[test]
    fn test_metrics_concurrent_record() {
        let metrics = BridgeMetrics::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..250 {
                        metrics.record(StatusCategory::RuntimeError);
                    }
                });
            }
        });
        assert_eq!(metrics.count(StatusCategory::RuntimeError), 1000);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = BridgeMetrics::new();
        metrics.record(StatusCategory::CompileError);
        metrics.reset();
        assert_eq!(metrics.snapshot(CacheStats::default()).executions, 0);
    }

    #[test]
    fn test_snapshot_carries_cache_stats() {
        let cache = CacheStats {
            hits: 9,
            misses: 1,
            ..CacheStats::default()
        };
        let snap = BridgeMetrics::new().snapshot(cache);
        assert_eq!(snap.cache.hits, 9);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["cache"]["misses"], 1);
    }
}

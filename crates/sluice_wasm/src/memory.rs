//! Memory limits for script execution.

use serde::{Deserialize, Serialize};
use wasmtime::ResourceLimiter;

/// WebAssembly page size
pub const PAGE_SIZE: u64 = 65536;

/// Memory limit configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimit {
    /// Maximum linear memory in bytes
    pub max_bytes: u64,
    /// Maximum table elements per table
    pub max_table_elements: u32,
}

impl MemoryLimit {
    /// Create a new memory limit
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            max_table_elements: 10_000,
        }
    }

    /// Create from a page count
    #[must_use]
    pub fn with_pages(max_pages: u64) -> Self {
        Self::new(max_pages * PAGE_SIZE)
    }

    /// Set the table element bound
    #[must_use]
    pub fn with_table_elements(mut self, elements: u32) -> Self {
        self.max_table_elements = elements;
        self
    }

    /// Get maximum pages
    #[must_use]
    pub fn max_pages(&self) -> u64 {
        self.max_bytes / PAGE_SIZE
    }

    /// Check if byte count is within limit
    #[must_use]
    pub fn within_limit(&self, bytes: u64) -> bool {
        bytes <= self.max_bytes
    }

    /// Validate the limit
    ///
    /// # Errors
    ///
    /// Returns error if the limit cannot hold a single page
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.max_bytes < PAGE_SIZE {
            return Err(MemoryError::BelowOnePage {
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024) // 16MB default
    }
}

/// Memory errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    /// Growth past the configured limit
    #[error("memory limit exceeded: requested {requested} bytes, limit {limit}")]
    LimitExceeded {
        /// Bytes the script asked for
        requested: u64,
        /// Configured limit
        limit: u64,
    },
    /// Configured limit smaller than one page
    #[error("memory limit of {limit} bytes is below one page")]
    BelowOnePage {
        /// Configured limit
        limit: u64,
    },
}

/// Per-store resource limiter
///
/// Refuses linear memory growth past the limit with a [`MemoryError`] so the
/// engine can tell a memory breach apart from other traps. Table growth past
/// the bound fails softly (the script sees `-1` from `table.grow`).
#[derive(Debug, Clone)]
pub struct SandboxLimiter {
    limit: MemoryLimit,
    peak_bytes: u64,
}

impl SandboxLimiter {
    /// Create a limiter
    #[must_use]
    pub fn new(limit: MemoryLimit) -> Self {
        Self {
            limit,
            peak_bytes: 0,
        }
    }

    /// Largest linear memory size granted so far
    #[must_use]
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes
    }

    /// The configured limit
    #[must_use]
    pub fn limit(&self) -> &MemoryLimit {
        &self.limit
    }
}

impl ResourceLimiter for SandboxLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let desired = desired as u64;
        if !self.limit.within_limit(desired) {
            return Err(wasmtime::Error::new(MemoryError::LimitExceeded {
                requested: desired,
                limit: self.limit.max_bytes,
            }));
        }
        self.peak_bytes = self.peak_bytes.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.limit.max_table_elements as usize)
    }

    fn instances(&self) -> usize {
        1
    }

    fn memories(&self) -> usize {
        1
    }

    fn tables(&self) -> usize {
        4
    }
}

//! Sandboxed execution contexts.
//!
//! A [`ScriptRuntime`] owns the wasmtime engine, the linker carrying the
//! binding surface, and the epoch ticker. It hands out [`SandboxContext`]s
//! from a bounded [`SandboxPool`]; each context is a fresh store with its own
//! memory limiter and budgets, and gives its pool slot back when dropped.

use crate::abi::ENTRY_POINT;
use crate::bindings::Bindings;
use crate::compile::{CompiledScript, EntryKind};
use crate::fuel::{BudgetUsage, EpochTicker, ExecutionBudget};
use crate::host::{self, HostState};
use crate::memory::{MemoryLimit, SandboxLimiter};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use wasmtime::{Engine, Instance, Linker, Store};

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Linear memory limit in bytes
    pub memory_limit_bytes: u64,
    /// Table element limit
    pub max_table_elements: u32,
    /// Fuel per run
    pub fuel_budget: u64,
    /// Wall-clock budget per run, milliseconds
    pub wall_clock_budget_ms: u64,
    /// Epoch tick interval, milliseconds
    pub epoch_tick_ms: u64,
}

impl SandboxConfig {
    /// Create a new sandbox config
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory_limit_bytes: 16 * 1024 * 1024, // 16MB
            max_table_elements: 10_000,
            fuel_budget: 10_000_000,
            wall_clock_budget_ms: 100,
            epoch_tick_ms: 10,
        }
    }

    /// Set memory limit
    #[must_use]
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Set fuel budget
    #[must_use]
    pub fn with_fuel_budget(mut self, fuel: u64) -> Self {
        self.fuel_budget = fuel;
        self
    }

    /// Set wall-clock budget
    #[must_use]
    pub fn with_wall_clock_budget(mut self, budget: Duration) -> Self {
        self.wall_clock_budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set epoch tick interval
    #[must_use]
    pub fn with_epoch_tick(mut self, tick: Duration) -> Self {
        self.epoch_tick_ms = u64::try_from(tick.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Budgets for one run
    #[must_use]
    pub fn budget(&self) -> ExecutionBudget {
        ExecutionBudget::new(
            self.fuel_budget,
            Duration::from_millis(self.wall_clock_budget_ms),
            Duration::from_millis(self.epoch_tick_ms),
        )
    }

    /// Memory limit for one run
    #[must_use]
    pub fn memory_limit(&self) -> MemoryLimit {
        MemoryLimit::new(self.memory_limit_bytes).with_table_elements(self.max_table_elements)
    }

    /// Validate budgets
    ///
    /// The memory limit is checked per acquisition, so a bad limit surfaces
    /// as a resource-initialization failure of each run.
    ///
    /// # Errors
    ///
    /// Returns error if a budget is zero or the epoch tick is over a second
    pub fn validate(&self) -> Result<(), SandboxError> {
        self.budget()
            .validate()
            .map_err(|err| SandboxError::Config(err.to_string()))
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent contexts
    pub size: usize,
    /// How long an acquisition waits for a free slot, milliseconds
    pub acquire_timeout_ms: u64,
}

impl PoolConfig {
    /// Create a new pool config
    #[must_use]
    pub fn new() -> Self {
        Self {
            size: 64,
            acquire_timeout_ms: 50,
        }
    }

    /// Set pool size
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set acquire timeout
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Sandbox errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    /// Engine or linker construction failed
    #[error("engine setup failed: {0}")]
    Engine(String),

    /// Invalid configuration
    #[error("invalid sandbox config: {0}")]
    Config(String),

    /// Epoch ticker thread could not start
    #[error("epoch ticker failed to start: {0}")]
    Ticker(String),

    /// A context could not be set up
    #[error("resource initialization failed: {0}")]
    ResourceInit(String),

    /// No pool slot freed up in time
    #[error("sandbox pool exhausted: {size} slots busy after {waited_ms}ms")]
    PoolExhausted {
        /// Pool size
        size: usize,
        /// Time spent waiting
        waited_ms: u64,
    },
}

impl SandboxError {
    /// Whether this error means a run could not get a context
    #[must_use]
    pub fn is_resource_init(&self) -> bool {
        matches!(self, Self::ResourceInit(_) | Self::PoolExhausted { .. })
    }
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<usize>>,
    available: Condvar,
    size: usize,
    acquire_timeout: Duration,
    exhausted: AtomicU64,
}

impl PoolInner {
    fn lock_free(&self) -> MutexGuard<'_, Vec<usize>> {
        match self.free.lock() {
            Ok(free) => free,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Bounded free-list of sandbox slots
#[derive(Debug, Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    /// Create a pool
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let size = config.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new((0..size).rev().collect()),
                available: Condvar::new(),
                size,
                acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Take a slot, waiting up to the acquire timeout
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PoolExhausted`] if no slot frees up in time
    pub fn acquire(&self) -> Result<PoolSlot, SandboxError> {
        let start = Instant::now();
        let deadline = start + self.inner.acquire_timeout;
        let mut free = self.inner.lock_free();
        loop {
            if let Some(id) = free.pop() {
                return Ok(PoolSlot {
                    id,
                    pool: self.inner.clone(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                self.inner.exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(SandboxError::PoolExhausted {
                    size: self.inner.size,
                    waited_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }
            free = match self.inner.available.wait_timeout(free, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Free slots right now
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock_free().len()
    }

    /// Total slots
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Acquisitions that timed out
    #[must_use]
    pub fn exhausted(&self) -> u64 {
        self.inner.exhausted.load(Ordering::Relaxed)
    }
}

/// A held pool slot; returned to the pool on drop
#[derive(Debug)]
pub struct PoolSlot {
    id: usize,
    pool: Arc<PoolInner>,
}

impl PoolSlot {
    /// Slot index
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.lock_free().push(self.id);
        self.pool.available.notify_one();
    }
}

/// Engine, linker and epoch ticker shared by every context
pub struct ScriptRuntime {
    engine: Engine,
    linker: Arc<Linker<HostState>>,
    config: SandboxConfig,
    pool: SandboxPool,
    ticker: EpochTicker,
}

impl ScriptRuntime {
    /// Build the engine, install the binding surface, start the ticker
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the engine cannot be
    /// built, or the ticker thread cannot start
    pub fn new(config: SandboxConfig, pool: &PoolConfig) -> Result<Self, SandboxError> {
        config.validate()?;

        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.epoch_interruption(true);
        let engine =
            Engine::new(&wasm_config).map_err(|err| SandboxError::Engine(format!("{:#}", err)))?;

        let mut linker = Linker::new(&engine);
        host::install(&mut linker).map_err(|err| SandboxError::Engine(format!("{:#}", err)))?;

        let ticker = EpochTicker::start(engine.clone(), config.budget().epoch_tick)
            .map_err(|err| SandboxError::Ticker(err.to_string()))?;

        tracing::debug!(
            memory_limit = config.memory_limit_bytes,
            fuel = config.fuel_budget,
            wall_clock_ms = config.wall_clock_budget_ms,
            pool = pool.size,
            "script runtime started"
        );

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            config,
            pool: SandboxPool::new(pool),
            ticker,
        })
    }

    /// The wasmtime engine; scripts must be compiled against it
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Sandbox configuration
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The slot pool
    #[must_use]
    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Epoch tick interval
    #[must_use]
    pub fn epoch_tick(&self) -> Duration {
        self.ticker.interval()
    }

    /// Acquire a fresh context
    ///
    /// # Errors
    ///
    /// Returns a resource-initialization error if the memory limit is below
    /// one page or no slot is free within the acquire timeout
    pub fn acquire(&self) -> Result<SandboxContext, SandboxError> {
        let limit = self.config.memory_limit();
        limit
            .validate()
            .map_err(|err| SandboxError::ResourceInit(err.to_string()))?;
        let slot = self.pool.acquire()?;

        let mut store = Store::new(&self.engine, HostState::new(SandboxLimiter::new(limit)));
        store.limiter(|state| &mut state.limiter);

        Ok(SandboxContext {
            store,
            linker: self.linker.clone(),
            budget: self.config.budget(),
            state: SandboxState::Ready,
            started: None,
            slot,
        })
    }
}

/// Lifecycle of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Fresh store, nothing installed
    Ready,
    /// Bindings installed
    Bound,
    /// Module instantiated under budget
    Instantiated,
    /// Entry point returned or trapped
    Finished,
}

/// Isolated runtime state for one execution
pub struct SandboxContext {
    store: Store<HostState>,
    linker: Arc<Linker<HostState>>,
    budget: ExecutionBudget,
    state: SandboxState,
    started: Option<Instant>,
    slot: PoolSlot,
}

impl SandboxContext {
    /// Install the run's binding set
    pub fn bind(&mut self, bindings: Bindings) {
        self.store.data_mut().bind(bindings);
        self.state = SandboxState::Bound;
    }

    /// Arm the budgets and instantiate `compiled`
    ///
    /// Budgets cover instantiation (start functions, data segments) and the
    /// call that follows.
    ///
    /// # Errors
    ///
    /// Returns the wasmtime error; a [`crate::MemoryError`] inside it means
    /// the initial memory did not fit the limit
    pub fn instantiate(&mut self, compiled: &CompiledScript) -> wasmtime::Result<Instance> {
        let start = Instant::now();
        self.store.set_fuel(self.budget.fuel)?;
        self.store.set_epoch_deadline(self.budget.epoch_ticks());
        self.store.epoch_deadline_trap();
        self.store
            .data_mut()
            .arm_deadline(self.budget.deadline_from(start));
        self.started = Some(start);

        let instance = self.linker.instantiate(&mut self.store, compiled.module())?;
        self.state = SandboxState::Instantiated;
        Ok(instance)
    }

    /// Call the entry point; a unit entry reports `0`
    ///
    /// # Errors
    ///
    /// Returns the trap or host error that ended the run
    pub fn call_entry(&mut self, instance: &Instance, entry: EntryKind) -> wasmtime::Result<i32> {
        let result = match entry {
            EntryKind::Status => instance
                .get_typed_func::<(), i32>(&mut self.store, ENTRY_POINT)
                .and_then(|run| run.call(&mut self.store, ())),
            EntryKind::Unit => instance
                .get_typed_func::<(), ()>(&mut self.store, ENTRY_POINT)
                .and_then(|run| run.call(&mut self.store, ()))
                .map(|()| 0),
        };
        self.state = SandboxState::Finished;
        result
    }

    /// Installed binding set
    #[must_use]
    pub fn bindings(&self) -> Option<&Bindings> {
        self.store.data().bindings()
    }

    /// Remove the binding set, staged writes included
    pub fn take_bindings(&mut self) -> Option<Bindings> {
        self.store.data_mut().take_bindings()
    }

    /// Resources used so far
    #[must_use]
    pub fn usage(&self) -> BudgetUsage {
        let remaining = self.store.get_fuel().unwrap_or(0);
        BudgetUsage {
            fuel_consumed: self.budget.fuel.saturating_sub(remaining),
            fuel_budget: self.budget.fuel,
            elapsed: self.started.map(|s| s.elapsed()).unwrap_or_default(),
            peak_memory_bytes: self.store.data().limiter().peak_bytes(),
        }
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Budgets this context runs under
    #[must_use]
    pub fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }

    /// Pool slot held by this context
    #[must_use]
    pub fn slot_id(&self) -> usize {
        self.slot.id()
    }
}

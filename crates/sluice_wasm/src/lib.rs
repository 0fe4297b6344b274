//! SLUICE WASM Sandbox
//!
//! Script execution primitives: the binding surface ABI, per-request
//! bindings with staged writes, fuel/epoch budgets, memory limits, host
//! functions, sandbox contexts, and the compiled-script cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod abi;
pub mod bindings;
pub mod compile;
pub mod fuel;
pub mod host;
pub mod memory;
pub mod sandbox;

pub use abi::{
    ABI_VERSION, BindingViolation, ErrorCode, HostImport, ImportDecl, SURFACE, check_import,
};
pub use bindings::{BindingLimits, BindingUsage, Bindings, FieldPath, StagedMutations};
pub use compile::{
    CacheConfig, CacheStats, CompileConfig, CompileError, CompiledScript, EntryKind, ScriptCache,
    ScriptCompiler,
};
pub use fuel::{BudgetKind, BudgetUsage, EpochTicker, ExecutionBudget, FuelError, MAX_EPOCH_TICK};
pub use host::{HostState, HostTrap};
pub use memory::{MemoryError, MemoryLimit, SandboxLimiter};
pub use sandbox::{
    PoolConfig, SandboxConfig, SandboxContext, SandboxError, SandboxPool, SandboxState,
    ScriptRuntime,
};

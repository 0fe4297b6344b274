//! Execution engine for compiled scripts.
//!
//! Runs one compiled script against one binding set inside one sandbox
//! context and folds every way the run can end into an [`ExecutionOutcome`].
//! Staged writes leave the engine only with a successful outcome.

use serde::Serialize;
use sluice_wasm::{
    BindingUsage, BindingViolation, Bindings, BudgetKind, BudgetUsage, CompileError,
    CompiledScript, FuelError, HostTrap, MemoryError, SandboxContext, SandboxError,
    ScriptRuntime, StagedMutations, check_import,
};
use wasmtime::Trap;

/// Resources a run used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Fuel, wall clock and memory
    pub budget: BudgetUsage,
    /// Host calls, staged bytes, storage calls and log records
    pub bindings: BindingUsage,
}

/// Ways a script can fail once it is running
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// A budget ran out
    #[error("{0} budget exhausted")]
    Timeout(BudgetKind),

    /// Linear memory growth hit the limit
    #[error("memory limit exceeded: {0}")]
    MemoryLimit(String),

    /// A host call was handed an unusable pointer or length
    #[error("{0}")]
    GuestMemory(String),

    /// The entry point returned a non-zero status
    #[error("script returned failure status {code}")]
    ScriptFailed {
        /// Returned status
        code: i32,
    },

    /// Any other trap
    #[error("trap: {0}")]
    Trap(String),
}

impl RuntimeError {
    /// Whether this is a budget timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result of one execution
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// Ran to completion with status 0
    Success {
        /// Writes to commit
        mutations: StagedMutations,
        /// Resources used
        stats: RunStats,
    },

    /// Script did not compile; nothing ran
    CompileError(CompileError),

    /// Script failed while running; staged writes were discarded
    RuntimeError {
        /// What went wrong
        error: RuntimeError,
        /// Resources used up to the failure
        stats: RunStats,
    },

    /// Script reached outside the binding surface
    BindingViolation(BindingViolation),

    /// No sandbox could be set up for the run
    ResourceInitError(String),
}

impl ExecutionOutcome {
    /// Whether the run succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Stats, for outcomes that got as far as running
    #[must_use]
    pub fn stats(&self) -> Option<&RunStats> {
        match self {
            Self::Success { stats, .. } | Self::RuntimeError { stats, .. } => Some(stats),
            _ => None,
        }
    }
}

impl From<CompileError> for ExecutionOutcome {
    fn from(err: CompileError) -> Self {
        Self::CompileError(err)
    }
}

impl From<SandboxError> for ExecutionOutcome {
    fn from(err: SandboxError) -> Self {
        Self::ResourceInitError(err.to_string())
    }
}

/// Phase a wasmtime error came out of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Instantiate,
    Call,
}

/// Runs compiled scripts on a [`ScriptRuntime`]
pub struct ExecutionEngine {
    runtime: ScriptRuntime,
}

impl ExecutionEngine {
    /// Create an engine over `runtime`
    #[must_use]
    pub fn new(runtime: ScriptRuntime) -> Self {
        Self { runtime }
    }

    /// Underlying runtime
    #[must_use]
    pub fn runtime(&self) -> &ScriptRuntime {
        &self.runtime
    }

    /// Acquire a sandbox context from the runtime's pool
    ///
    /// # Errors
    ///
    /// Returns error if the memory limit is unusable or the pool is exhausted
    pub fn acquire(&self) -> Result<SandboxContext, SandboxError> {
        self.runtime.acquire()
    }

    /// Acquire a context and run `compiled` in it
    pub fn execute(&self, compiled: &CompiledScript, bindings: Bindings) -> ExecutionOutcome {
        match self.acquire() {
            Ok(ctx) => self.run(compiled, bindings, ctx),
            Err(err) => err.into(),
        }
    }

    /// Run `compiled` against `bindings` inside `ctx`
    ///
    /// The context is consumed; its pool slot is released when this returns.
    pub fn run(
        &self,
        compiled: &CompiledScript,
        bindings: Bindings,
        mut ctx: SandboxContext,
    ) -> ExecutionOutcome {
        if let Err(violation) = check_bindings(compiled, &bindings) {
            return ExecutionOutcome::BindingViolation(violation);
        }

        ctx.bind(bindings);

        let instance = match ctx.instantiate(compiled) {
            Ok(instance) => instance,
            Err(err) => return finish_failed(&mut ctx, err, Phase::Instantiate),
        };

        let code = match ctx.call_entry(&instance, compiled.entry()) {
            Ok(code) => code,
            Err(err) => return finish_failed(&mut ctx, err, Phase::Call),
        };

        let stats = stats_of(&ctx);
        if code != 0 {
            ctx.take_bindings();
            return ExecutionOutcome::RuntimeError {
                error: RuntimeError::ScriptFailed { code },
                stats,
            };
        }

        match ctx.take_bindings() {
            Some(bindings) => {
                tracing::debug!(
                    script = %compiled.hash().short(),
                    fuel_consumed = stats.budget.fuel_consumed,
                    host_calls = stats.bindings.host_calls,
                    elapsed_us = stats.budget.elapsed.as_micros() as u64,
                    "script run complete"
                );
                ExecutionOutcome::Success {
                    mutations: bindings.into_staged(),
                    stats,
                }
            }
            None => ExecutionOutcome::RuntimeError {
                error: RuntimeError::Trap(HostTrap::Unbound.to_string()),
                stats,
            },
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", self.runtime.config())
            .finish_non_exhaustive()
    }
}

/// Every declared import must be on the surface and granted at this hook
fn check_bindings(compiled: &CompiledScript, bindings: &Bindings) -> Result<(), BindingViolation> {
    for decl in compiled.imports() {
        let import = check_import(decl)?;
        if !bindings.capabilities().has(import.capability) {
            return Err(BindingViolation::not_granted(import.capability));
        }
    }
    Ok(())
}

fn stats_of(ctx: &SandboxContext) -> RunStats {
    RunStats {
        budget: ctx.usage(),
        bindings: ctx.bindings().map(Bindings::usage).unwrap_or_default(),
    }
}

fn finish_failed(ctx: &mut SandboxContext, err: wasmtime::Error, phase: Phase) -> ExecutionOutcome {
    let stats = stats_of(ctx);
    ctx.take_bindings();
    match classify(&err, phase) {
        Classified::Runtime(error) => ExecutionOutcome::RuntimeError { error, stats },
        Classified::Violation(violation) => ExecutionOutcome::BindingViolation(violation),
        Classified::ResourceInit(reason) => ExecutionOutcome::ResourceInitError(reason),
    }
}

enum Classified {
    Runtime(RuntimeError),
    Violation(BindingViolation),
    ResourceInit(String),
}

fn classify(err: &wasmtime::Error, phase: Phase) -> Classified {
    if let Some(trap) = err.downcast_ref::<HostTrap>() {
        return match trap {
            HostTrap::Violation(violation) => Classified::Violation(violation.clone()),
            HostTrap::DeadlineExceeded => {
                Classified::Runtime(RuntimeError::Timeout(BudgetKind::WallClock))
            }
            HostTrap::OutOfFuel(FuelError::OutOfFuel { .. }) => {
                Classified::Runtime(RuntimeError::Timeout(BudgetKind::Fuel))
            }
            HostTrap::GuestMemory(detail) => {
                Classified::Runtime(RuntimeError::GuestMemory(detail.clone()))
            }
            other => Classified::Runtime(RuntimeError::Trap(other.to_string())),
        };
    }

    if let Some(memory) = err.downcast_ref::<MemoryError>() {
        return match phase {
            Phase::Instantiate => Classified::ResourceInit(memory.to_string()),
            Phase::Call => Classified::Runtime(RuntimeError::MemoryLimit(memory.to_string())),
        };
    }

    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => Classified::Runtime(RuntimeError::Timeout(BudgetKind::Fuel)),
        Some(Trap::Interrupt) => Classified::Runtime(RuntimeError::Timeout(BudgetKind::WallClock)),
        Some(trap) => Classified::Runtime(RuntimeError::Trap(trap.to_string())),
        None => Classified::Runtime(RuntimeError::Trap(format!("{:#}", err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{
        CapabilitySet, HookPoint, MemoryMetadataStore, RequestState, RestContext, ScriptSource,
    };
    use sluice_log::NullSink;
    use sluice_wasm::{CompileConfig, PoolConfig, SandboxConfig, ScriptCompiler};
    use std::sync::Arc;
    use std::time::Duration;

    fn engine(config: SandboxConfig) -> ExecutionEngine {
        ExecutionEngine::new(ScriptRuntime::new(config, &PoolConfig::new().with_size(4)).unwrap())
    }

    fn compile(engine: &ExecutionEngine, wat: &str) -> CompiledScript {
        ScriptCompiler::new(engine.runtime().engine().clone(), CompileConfig::default())
            .compile(&ScriptSource::from_text(wat))
            .unwrap()
    }

    fn bindings() -> Bindings {
        Bindings::new(
            HookPoint::PreRequest,
            "preRequest",
            &RequestState::new("GET", "/photos/cat.jpg").with_trans_id("tx-1"),
            &RestContext::default(),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(NullSink),
        )
    }

    fn run(engine: &ExecutionEngine, wat: &str) -> ExecutionOutcome {
        let compiled = compile(engine, wat);
        engine.execute(&compiled, bindings())
    }

    const SET_HEADER: &str = r#"(module
        (import "gateway" "field_set" (func $set (param i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "response.header.X-Processed")
        (data (i32.const 32) "true")
        (func (export "run") (result i32)
            (drop (call $set (i32.const 0) (i32.const 27) (i32.const 32) (i32.const 4)))
            (i32.const 0)))"#;

    #[test]
    fn test_success_returns_staged_writes() {
        let engine = engine(SandboxConfig::default());
        match run(&engine, SET_HEADER) {
            ExecutionOutcome::Success { mutations, stats } => {
                assert_eq!(mutations.len(), 1);
                assert_eq!(
                    mutations.response_headers.lookup("x-processed"),
                    Some(Some("true"))
                );
                assert_eq!(stats.bindings.host_calls, 1);
                assert!(stats.budget.fuel_consumed > 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_nonzero_status_is_script_failure() {
        let engine = engine(SandboxConfig::default());
        let outcome = run(&engine, r#"(module (func (export "run") (result i32) (i32.const 3)))"#);
        match outcome {
            ExecutionOutcome::RuntimeError { error, .. } => {
                assert_eq!(error, RuntimeError::ScriptFailed { code: 3 });
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_trap_discards_writes() {
        let engine = engine(SandboxConfig::default());
        let wat = SET_HEADER.replace("(i32.const 0)))", "(unreachable)))");
        match run(&engine, &wat) {
            ExecutionOutcome::RuntimeError { error: RuntimeError::Trap(msg), .. } => {
                assert!(msg.contains("unreachable"), "{}", msg);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_fuel_exhaustion_is_timeout() {
        let engine = engine(SandboxConfig::new().with_fuel_budget(50_000));
        let outcome = run(&engine, r#"(module (func (export "run") (loop $l (br $l))))"#);
        match outcome {
            ExecutionOutcome::RuntimeError { error, stats } => {
                assert_eq!(error, RuntimeError::Timeout(BudgetKind::Fuel));
                assert!(stats.budget.fuel_consumed > 45_000);
                assert!(stats.budget.fuel_consumed <= 50_000);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_wall_clock_is_timeout() {
        let config = SandboxConfig::new()
            .with_fuel_budget(1 << 40)
            .with_wall_clock_budget(Duration::from_millis(20))
            .with_epoch_tick(Duration::from_millis(5));
        let engine = engine(config);
        let outcome = run(&engine, r#"(module (func (export "run") (loop $l (br $l))))"#);
        match outcome {
            ExecutionOutcome::RuntimeError { error, .. } => {
                assert_eq!(error, RuntimeError::Timeout(BudgetKind::WallClock));
                assert!(error.is_timeout());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_memory_growth_is_runtime_memory_limit() {
        let engine = engine(SandboxConfig::new().with_memory_limit(2 * 65536));
        let outcome = run(
            &engine,
            r#"(module
                (memory (export "memory") 1)
                (func (export "run") (drop (memory.grow (i32.const 4)))))"#,
        );
        assert!(matches!(
            outcome,
            ExecutionOutcome::RuntimeError { error: RuntimeError::MemoryLimit(_), .. }
        ));
    }

    #[test]
    fn test_initial_memory_over_limit_is_resource_init() {
        let engine = engine(SandboxConfig::new().with_memory_limit(2 * 65536));
        let outcome = run(
            &engine,
            r#"(module (memory (export "memory") 8) (func (export "run")))"#,
        );
        assert!(matches!(outcome, ExecutionOutcome::ResourceInitError(_)));
    }

    #[test]
    fn test_start_function_trap_is_runtime_error() {
        let engine = engine(SandboxConfig::default());
        let outcome = run(
            &engine,
            r#"(module (func $boom unreachable) (start $boom) (func (export "run")))"#,
        );
        assert!(matches!(
            outcome,
            ExecutionOutcome::RuntimeError { error: RuntimeError::Trap(_), .. }
        ));
    }

    #[test]
    fn test_unknown_import_rejected_before_run() {
        let engine = engine(SandboxConfig::default());
        let outcome = run(
            &engine,
            r#"(module
                (import "gateway" "spawn" (func))
                (func (export "run")))"#,
        );
        match outcome {
            ExecutionOutcome::BindingViolation(violation) => {
                assert_eq!(violation.capability, "gateway::spawn");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(engine.runtime().pool().available(), 4);
    }

    #[test]
    fn test_ungranted_capability_rejected() {
        let engine = engine(SandboxConfig::default());
        let compiled = compile(&engine, SET_HEADER);
        let outcome = engine.execute(
            &compiled,
            bindings().with_capabilities(CapabilitySet::read_only()),
        );
        assert!(matches!(outcome, ExecutionOutcome::BindingViolation(_)));
    }

    #[test]
    fn test_host_violation_during_run() {
        let engine = engine(SandboxConfig::default());
        let outcome = run(
            &engine,
            r#"(module
                (import "gateway" "field_set" (func $set (param i32 i32 i32 i32) (result i32)))
                (memory (export "memory") 1)
                (data (i32.const 0) "method")
                (func (export "run") (result i32)
                    (call $set (i32.const 0) (i32.const 6) (i32.const 0) (i32.const 3))))"#,
        );
        match outcome {
            ExecutionOutcome::BindingViolation(violation) => {
                assert_eq!(violation.capability, "field:method");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_guest_memory_fault() {
        let engine = engine(SandboxConfig::default());
        let outcome = run(
            &engine,
            r#"(module
                (import "gateway" "debug" (func $debug (param i32 i32)))
                (memory (export "memory") 1)
                (func (export "run") (call $debug (i32.const 65500) (i32.const 100))))"#,
        );
        assert!(matches!(
            outcome,
            ExecutionOutcome::RuntimeError { error: RuntimeError::GuestMemory(_), .. }
        ));
    }

    #[test]
    fn test_pool_exhaustion_is_resource_init() {
        let runtime = ScriptRuntime::new(
            SandboxConfig::default(),
            &PoolConfig::new()
                .with_size(1)
                .with_acquire_timeout(Duration::from_millis(5)),
        )
        .unwrap();
        let engine = ExecutionEngine::new(runtime);
        let held = engine.acquire().unwrap();
        let outcome = run(&engine, r#"(module (func (export "run")))"#);
        assert!(matches!(outcome, ExecutionOutcome::ResourceInitError(_)));
        drop(held);
        assert!(run(&engine, r#"(module (func (export "run")))"#).is_success());
    }

    #[test]
    fn test_compile_failure_is_outcome() {
        let engine = engine(SandboxConfig::default());
        let err = ScriptCompiler::new(engine.runtime().engine().clone(), CompileConfig::default())
            .compile(&ScriptSource::from_text("(module"))
            .unwrap_err();
        let outcome = ExecutionOutcome::from(err);
        assert!(matches!(outcome, ExecutionOutcome::CompileError(_)));
        assert!(!outcome.is_success());
        assert!(outcome.stats().is_none());
    }

    #[test]
    fn test_slot_returned_after_failure() {
        let engine = engine(SandboxConfig::new().with_fuel_budget(10_000));
        let _ = run(&engine, r#"(module (func (export "run") (loop $l (br $l))))"#);
        assert_eq!(engine.runtime().pool().available(), 4);
    }
}

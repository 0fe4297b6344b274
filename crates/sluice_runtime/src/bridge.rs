//! Host bridge: the single entry point the gateway calls at a hook point.
//!
//! One call resolves the hook, compiles (or fetches) the script, acquires a
//! sandbox, runs the script under budget and, only on success, commits the
//! staged writes into the caller's request state. Every other ending is
//! logged to the caller's sink and to `tracing`, then reduced to a status
//! code; nothing escapes as a panic or error value.

use sluice_core::{Hash, HookPoint, MetadataStore, RequestState, RestContext, ScriptSource};
use sluice_log::{LogRecord, LogSink, RecordSource, Severity};
use sluice_wasm::{Bindings, CompileError, SandboxError, ScriptCache, ScriptRuntime};
use std::fmt;
use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::engine::{ExecutionEngine, ExecutionOutcome, RuntimeError};
use crate::monitor::{BridgeMetrics, Metrics};
use crate::status::StatusCategory;

/// Where one invocation is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    /// Hook not yet resolved
    Idle,
    /// Looking up or compiling the script
    Compiling,
    /// Bindings built and sandbox acquired
    Bound,
    /// Script executing
    Running,
    /// Staged writes applied
    Committed,
    /// Staged writes, if any, dropped
    Discarded,
}

impl InvocationState {
    /// Whether no further transition is possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Discarded)
    }

    /// Whether `self -> next` is a legal step
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Compiling)
                | (Self::Compiling, Self::Bound)
                | (Self::Bound, Self::Running)
                | (Self::Running, Self::Committed)
                | (Self::Idle | Self::Compiling | Self::Bound | Self::Running, Self::Discarded)
        )
    }
}

impl fmt::Display for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Compiling => "compiling",
            Self::Bound => "bound",
            Self::Running => "running",
            Self::Committed => "committed",
            Self::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// Bridge errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Configuration failed validation
    #[error("invalid bridge config: {0}")]
    Config(sluice_core::CoreError),

    /// Engine, linker or ticker could not be built
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Op name does not name a hook
    #[error("{0}")]
    InvalidHook(sluice_core::CoreError),

    /// Script failed to compile
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Illegal lifecycle step
    #[error("invalid invocation transition {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: InvocationState,
        /// Requested state
        to: InvocationState,
    },
}

/// Tracks one `execute` call for state checks and failure reports
#[derive(Debug)]
pub struct Invocation<'a> {
    state: InvocationState,
    op_name: &'a str,
    trans_id: String,
    hook: Option<HookPoint>,
    script: Option<Hash>,
}

impl<'a> Invocation<'a> {
    /// Start an invocation for `op_name`
    #[must_use]
    pub fn new(op_name: &'a str, trans_id: impl Into<String>) -> Self {
        Self {
            state: InvocationState::Idle,
            op_name,
            trans_id: trans_id.into(),
            hook: None,
            script: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Resolved hook, once known
    #[must_use]
    pub fn hook(&self) -> Option<&HookPoint> {
        self.hook.as_ref()
    }

    /// Script hash, once known
    #[must_use]
    pub fn script(&self) -> Option<Hash> {
        self.script
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns error if the step is not legal from the current state
    pub fn advance(&mut self, next: InvocationState) -> Result<(), BridgeError> {
        if !self.state.can_transition(next) {
            return Err(BridgeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Move to `Discarded` unless already terminal
    pub fn discard(&mut self) {
        if !self.state.is_terminal() {
            self.state = InvocationState::Discarded;
        }
    }
}

/// Why an invocation did not commit
#[derive(Debug)]
struct Failure {
    category: StatusCategory,
    message: String,
}

impl Failure {
    fn new(category: StatusCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<BridgeError> for Failure {
    fn from(err: BridgeError) -> Self {
        let category = match &err {
            BridgeError::InvalidHook(_) => StatusCategory::InvalidHook,
            BridgeError::Compile(_) => StatusCategory::CompileError,
            BridgeError::Config(_) | BridgeError::Sandbox(_) => StatusCategory::ResourceInit,
            BridgeError::InvalidTransition { .. } => StatusCategory::RuntimeError,
        };
        Self::new(category, err.to_string())
    }
}

fn runtime_category(error: &RuntimeError) -> StatusCategory {
    match error {
        RuntimeError::Timeout(_) => StatusCategory::Timeout,
        RuntimeError::MemoryLimit(_) => StatusCategory::MemoryLimit,
        RuntimeError::GuestMemory(_)
        | RuntimeError::ScriptFailed { .. }
        | RuntimeError::Trap(_) => StatusCategory::RuntimeError,
    }
}

/// The gateway's handle on script execution
///
/// Shared across request threads; every method takes `&self`.
pub struct HostBridge {
    config: BridgeConfig,
    engine: ExecutionEngine,
    cache: ScriptCache,
    metrics: BridgeMetrics,
}

impl HostBridge {
    /// Build the engine, pool and cache described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the engine cannot be built
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate().map_err(BridgeError::Config)?;
        let runtime = ScriptRuntime::new(config.sandbox.clone(), &config.pool)?;
        let cache = ScriptCache::from_config(runtime.engine().clone(), &config.cache);
        tracing::info!(
            pool_size = config.pool.size,
            cache_capacity = config.cache.capacity,
            fuel_budget = config.sandbox.fuel_budget,
            wall_clock_ms = config.sandbox.wall_clock_budget_ms,
            "script bridge ready"
        );
        Ok(Self {
            config,
            engine: ExecutionEngine::new(runtime),
            cache,
            metrics: BridgeMetrics::new(),
        })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Execution engine
    #[must_use]
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Compilation cache
    #[must_use]
    pub fn cache(&self) -> &ScriptCache {
        &self.cache
    }

    /// Metrics snapshot, cache stats included
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot(self.cache.stats())
    }

    /// Compile `script_text` ahead of time and record it as the script for
    /// `op_name`; the script it replaces is dropped from the cache
    ///
    /// # Errors
    ///
    /// Returns error if the op name is not a hook or the script does not compile
    pub fn load_script(&self, op_name: &str, script_text: &str) -> Result<Hash, BridgeError> {
        let hook = HookPoint::parse(op_name).map_err(BridgeError::InvalidHook)?;
        let source = ScriptSource::from_text(script_text);
        let compiled = self.cache.lookup_or_compile(&source)?;
        if let Some(old) = self.cache.bind_hook(hook.clone(), compiled.hash()) {
            tracing::info!(
                hook = %hook,
                old = %old.short(),
                new = %compiled.hash().short(),
                "hook script replaced"
            );
        }
        Ok(compiled.hash())
    }

    /// Run `script_text` at hook `op_name` against `request`
    ///
    /// Returns `0` on success with the script's writes applied to `request`;
    /// any other value is a failure status (see [`StatusCategory`]) and
    /// `request` is untouched.
    pub fn execute(
        &self,
        store: Arc<dyn MetadataStore>,
        rest: &RestContext,
        log_sink: Arc<dyn LogSink>,
        request: &mut RequestState,
        op_name: &str,
        script_text: &str,
    ) -> i32 {
        let mut invocation = Invocation::new(op_name, request.trans_id.clone());
        let result = self.invoke(&mut invocation, store, rest, &log_sink, request, script_text);
        let category = match result {
            Ok(()) => StatusCategory::Success,
            Err(failure) => {
                invocation.discard();
                self.report(&invocation, log_sink.as_ref(), &failure);
                failure.category
            }
        };
        self.metrics.record(category);
        category.code()
    }

    fn invoke(
        &self,
        invocation: &mut Invocation<'_>,
        store: Arc<dyn MetadataStore>,
        rest: &RestContext,
        log_sink: &Arc<dyn LogSink>,
        request: &mut RequestState,
        script_text: &str,
    ) -> Result<(), Failure> {
        let hook = HookPoint::parse(invocation.op_name).map_err(BridgeError::InvalidHook)?;
        invocation.hook = Some(hook.clone());
        invocation.advance(InvocationState::Compiling)?;

        let source = ScriptSource::from_text(script_text);
        invocation.script = Some(source.hash());
        let compiled = match self.cache.lookup_or_compile(&source) {
            Ok(compiled) => compiled,
            Err(err) => return self.settle(invocation, request, err.into()),
        };

        let bindings = Bindings::new(
            hook.clone(),
            invocation.op_name,
            request,
            rest,
            store,
            Arc::clone(log_sink),
        )
        .with_capabilities(self.config.capabilities_for(&hook).clone())
        .with_limits(self.config.limits.clone());
        let ctx = self
            .engine
            .acquire()
            .map_err(|err| Failure::new(StatusCategory::ResourceInit, err.to_string()))?;
        invocation.advance(InvocationState::Bound)?;

        invocation.advance(InvocationState::Running)?;
        let outcome = self.engine.run(&compiled, bindings, ctx);
        self.settle(invocation, request, outcome)
    }

    /// Commit a successful outcome or turn a failed one into its status
    fn settle(
        &self,
        invocation: &mut Invocation<'_>,
        request: &mut RequestState,
        outcome: ExecutionOutcome,
    ) -> Result<(), Failure> {
        match outcome {
            ExecutionOutcome::Success { mutations, stats } => {
                self.metrics.record_run(&stats);
                invocation.advance(InvocationState::Committed)?;
                tracing::debug!(
                    hook = invocation.op_name,
                    trans_id = %invocation.trans_id,
                    writes = mutations.len(),
                    "committing script writes"
                );
                mutations.apply(request);
                Ok(())
            }
            ExecutionOutcome::RuntimeError { error, stats } => {
                self.metrics.record_run(&stats);
                Err(Failure::new(runtime_category(&error), error.to_string()))
            }
            ExecutionOutcome::BindingViolation(violation) => Err(Failure::new(
                StatusCategory::BindingViolation,
                violation.to_string(),
            )),
            ExecutionOutcome::ResourceInitError(reason) => {
                Err(Failure::new(StatusCategory::ResourceInit, reason))
            }
            ExecutionOutcome::CompileError(err) => {
                Err(Failure::new(StatusCategory::CompileError, err.to_string()))
            }
        }
    }

    fn report(&self, invocation: &Invocation<'_>, sink: &dyn LogSink, failure: &Failure) {
        let category = failure.category;
        let hook = invocation.hook.as_ref().map(|h| h.as_str().to_string());
        let script = invocation.script.map(|h| h.to_hex());
        let severity = if category == StatusCategory::BindingViolation {
            Severity::Security
        } else {
            Severity::Error
        };

        sink.emit(
            LogRecord::new(RecordSource::Bridge, category.as_str())
                .with_severity(severity)
                .with_request(invocation.trans_id.as_str(), invocation.op_name)
                .with_field("category", category.as_str())
                .with_field("code", category.code())
                .with_field("message", failure.message.as_str())
                .with_field("hook", hook.clone())
                .with_field("script", script),
        );

        let short = invocation.script.map(|h| h.short()).unwrap_or_default();
        if severity == Severity::Security {
            tracing::warn!(
                target: "sluice::security",
                op = invocation.op_name,
                hook = hook.as_deref().unwrap_or(""),
                script = %short,
                trans_id = %invocation.trans_id,
                code = category.code(),
                "script binding violation: {}",
                failure.message
            );
        } else {
            tracing::warn!(
                op = invocation.op_name,
                hook = hook.as_deref().unwrap_or(""),
                script = %short,
                trans_id = %invocation.trans_id,
                code = category.code(),
                category = category.as_str(),
                "script failed: {}",
                failure.message
            );
        }
    }
}

impl fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBridge")
            .field("config", &self.config)
            .field("cached_scripts", &self.cache.len())
            .finish_non_exhaustive()
    }
}

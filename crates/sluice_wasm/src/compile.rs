//! Script compilation and the compiled-script cache.
//!
//! Compilation is deterministic: the same source bytes always give an
//! equivalent [`CompiledScript`], keyed by the source's content hash.
//! [`ScriptCache`] compiles each unseen hash once, even when several requests
//! miss on it at the same moment, and hands out shared `Arc`s that stay valid
//! after eviction.

use crate::abi::{ENTRY_POINT, ImportDecl, ImportShape};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sluice_core::{Hash, HookPoint, ScriptSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use wasmtime::{Engine, ExternType, Module, ValType};

/// Compilation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Largest accepted source, text or binary
    pub max_script_bytes: usize,
}

impl CompileConfig {
    /// Create a new compile config
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_script_bytes: 256 * 1024,
        }
    }

    /// Set the source size bound
    #[must_use]
    pub fn with_max_script_bytes(mut self, bytes: usize) -> Self {
        self.max_script_bytes = bytes;
        self
    }
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Compilation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// Empty source
    #[error("script source is empty")]
    Empty,

    /// Source over the size bound
    #[error("script is {size} bytes, limit is {limit}")]
    TooLarge {
        /// Source size
        size: usize,
        /// Configured bound
        limit: usize,
    },

    /// Text format failed to parse
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Module failed validation or compilation
    #[error("invalid module: {0}")]
    InvalidModule(String),

    /// No `run` function exported
    #[error("script does not export a `run` function")]
    MissingEntry,

    /// `run` has the wrong type
    #[error("`run` must take no parameters and return nothing or i32, found {0}")]
    BadEntrySignature(String),
}

/// Shape of the script's entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// `run: () -> ()`
    Unit,
    /// `run: () -> i32`; non-zero is a script-raised failure
    Status,
}

/// A compiled, validated script
#[derive(Debug, Clone)]
pub struct CompiledScript {
    hash: Hash,
    module: Module,
    entry: EntryKind,
    imports: Vec<ImportDecl>,
    source_len: usize,
}

impl CompiledScript {
    /// Content hash of the source this was compiled from
    #[must_use]
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The wasmtime module
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Entry point shape
    #[must_use]
    pub fn entry(&self) -> EntryKind {
        self.entry
    }

    /// Every import the script declares
    #[must_use]
    pub fn imports(&self) -> &[ImportDecl] {
        &self.imports
    }

    /// Source size in bytes
    #[must_use]
    pub fn source_len(&self) -> usize {
        self.source_len
    }
}

/// Compiles script source for one engine
#[derive(Clone)]
pub struct ScriptCompiler {
    engine: Engine,
    config: CompileConfig,
}

impl ScriptCompiler {
    /// Create a compiler
    #[must_use]
    pub fn new(engine: Engine, config: CompileConfig) -> Self {
        Self { engine, config }
    }

    /// Compile configuration
    #[must_use]
    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    /// Compile a script from text or binary source
    ///
    /// # Errors
    ///
    /// Returns error if the source is empty or too large, fails to parse or
    /// validate, or lacks a well-typed `run` export
    pub fn compile(&self, source: &ScriptSource) -> Result<CompiledScript, CompileError> {
        if source.is_empty() {
            return Err(CompileError::Empty);
        }
        if source.len() > self.config.max_script_bytes {
            return Err(CompileError::TooLarge {
                size: source.len(),
                limit: self.config.max_script_bytes,
            });
        }

        let wasm = wat::parse_bytes(source.bytes())
            .map_err(|err| CompileError::Syntax(err.to_string()))?;
        let module = Module::from_binary(&self.engine, &wasm)
            .map_err(|err| CompileError::InvalidModule(format!("{:#}", err)))?;

        let entry = entry_kind(&module)?;
        let imports = module
            .imports()
            .map(|import| ImportDecl {
                module: import.module().to_string(),
                name: import.name().to_string(),
                shape: import_shape(&import.ty()),
            })
            .collect();

        tracing::debug!(
            script = %source.hash().short(),
            bytes = source.len(),
            "compiled script"
        );

        Ok(CompiledScript {
            hash: source.hash(),
            module,
            entry,
            imports,
            source_len: source.len(),
        })
    }
}

fn entry_kind(module: &Module) -> Result<EntryKind, CompileError> {
    let ty = module
        .exports()
        .find(|export| export.name() == ENTRY_POINT)
        .map(|export| export.ty())
        .ok_or(CompileError::MissingEntry)?;
    let ExternType::Func(func) = ty else {
        return Err(CompileError::MissingEntry);
    };
    let params = func.params().len();
    let results: Vec<ValType> = func.results().collect();
    match (params, results.as_slice()) {
        (0, []) => Ok(EntryKind::Unit),
        (0, [ValType::I32]) => Ok(EntryKind::Status),
        _ => Err(CompileError::BadEntrySignature(format!(
            "{} params, {} results",
            params,
            results.len()
        ))),
    }
}

fn import_shape(ty: &ExternType) -> ImportShape {
    match ty {
        ExternType::Func(func) => {
            let all_i32 = func
                .params()
                .chain(func.results())
                .all(|v| matches!(v, ValType::I32));
            ImportShape::Func {
                params: func.params().len(),
                results: func.results().len(),
                all_i32,
            }
        }
        ExternType::Memory(_) => ImportShape::Other("memory"),
        ExternType::Table(_) => ImportShape::Other("table"),
        ExternType::Global(_) => ImportShape::Other("global"),
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached entries
    pub capacity: usize,
    /// Compiler settings
    pub compile: CompileConfig,
}

impl CacheConfig {
    /// Create a new cache config
    #[must_use]
    pub fn new() -> Self {
        Self {
            capacity: 256,
            compile: CompileConfig::new(),
        }
    }

    /// Set capacity
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that found an entry
    pub hits: u64,
    /// Lookups that created an entry
    pub misses: u64,
    /// Compilations run
    pub compiles: u64,
    /// Entries dropped for capacity
    pub evictions: u64,
    /// Entries dropped by invalidation or hook rebinding
    pub invalidations: u64,
    /// Entries currently cached
    pub entries: usize,
}

impl CacheStats {
    /// Hit ratio over all lookups
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    compiles: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

type CompileResult = Result<Arc<CompiledScript>, CompileError>;

/// One cache slot; initialized exactly once by whoever missed first
type Slot = Arc<OnceLock<CompileResult>>;

/// Content-addressed LRU cache of compiled scripts
pub struct ScriptCache {
    compiler: ScriptCompiler,
    capacity: usize,
    entries: Mutex<IndexMap<Hash, Slot>>,
    hooks: Mutex<HashMap<HookPoint, Hash>>,
    counters: CacheCounters,
}

impl ScriptCache {
    /// Create a cache
    #[must_use]
    pub fn new(compiler: ScriptCompiler, capacity: usize) -> Self {
        Self {
            compiler,
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
            hooks: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
        }
    }

    /// Create a cache from configuration
    #[must_use]
    pub fn from_config(engine: Engine, config: &CacheConfig) -> Self {
        Self::new(
            ScriptCompiler::new(engine, config.compile.clone()),
            config.capacity,
        )
    }

    /// The underlying compiler
    #[must_use]
    pub fn compiler(&self) -> &ScriptCompiler {
        &self.compiler
    }

    /// Return the compiled form of `source`, compiling it on first sight
    ///
    /// Concurrent callers missing on the same hash wait for a single compile.
    /// Compile errors are cached like successes.
    ///
    /// # Errors
    ///
    /// Returns the (possibly cached) compile error
    pub fn lookup_or_compile(&self, source: &ScriptSource) -> CompileResult {
        let hash = source.hash();
        let slot = self.slot_for(hash);
        slot.get_or_init(|| {
            self.counters.compiles.fetch_add(1, Ordering::Relaxed);
            self.compiler.compile(source).map(Arc::new)
        })
        .clone()
    }

    fn slot_for(&self, hash: Hash) -> Slot {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(index) = entries.get_index_of(&hash) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            let last = entries.len() - 1;
            entries.move_index(index, last);
            if let Some((_, slot)) = entries.get_index(last) {
                return slot.clone();
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let slot = Slot::default();
        entries.insert(hash, slot.clone());
        while entries.len() > self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(script = %evicted.short(), "evicted compiled script");
            }
        }
        slot
    }

    /// Peek at a successfully compiled entry without touching LRU order
    #[must_use]
    pub fn get(&self, hash: &Hash) -> Option<Arc<CompiledScript>> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(hash)
            .and_then(|slot| slot.get())
            .and_then(|result| result.as_ref().ok())
            .cloned()
    }

    /// Drop an entry from lookups; holders keep their `Arc`
    pub fn invalidate(&self, hash: &Hash) -> bool {
        let removed = match self.entries.lock() {
            Ok(mut entries) => entries.shift_remove(hash).is_some(),
            Err(poisoned) => poisoned.into_inner().shift_remove(hash).is_some(),
        };
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(script = %hash.short(), "invalidated compiled script");
        }
        removed
    }

    /// Record which script a hook runs; a replaced script no other hook
    /// uses is invalidated. Returns the replaced hash.
    pub fn bind_hook(&self, hook: HookPoint, hash: Hash) -> Option<Hash> {
        let previous = {
            let mut hooks = match self.hooks.lock() {
                Ok(hooks) => hooks,
                Err(poisoned) => poisoned.into_inner(),
            };
            let previous = hooks.insert(hook, hash);
            previous.filter(|old| *old != hash && !hooks.values().any(|h| h == old))
        };
        if let Some(old) = previous {
            self.invalidate(&old);
        }
        previous
    }

    /// Hash currently bound to a hook
    #[must_use]
    pub fn bound_hash(&self, hook: &HookPoint) -> Option<Hash> {
        self.hooks.lock().ok()?.get(hook).copied()
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry bound
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            compiles: self.counters.compiles.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

//! Host functions for script execution.
//!
//! [`install`] registers every import of the binding surface on a linker.
//! Each call is charged fuel, checks the wall-clock deadline, copies its
//! arguments out of guest memory, and forwards to the run's [`Bindings`].
//! Script-visible failures come back as negative return values; anything
//! that must end the run is raised as a [`HostTrap`].

use crate::abi::{BindingViolation, ErrorCode, IMPORT_MODULE, MEMORY_EXPORT, lookup};
use crate::bindings::{BindingLimits, Bindings, SurfaceError};
use crate::fuel::FuelError;
use crate::memory::SandboxLimiter;
use std::time::Instant;
use wasmtime::{Caller, Extern, Linker, Memory};

/// Store data for one sandbox
#[derive(Debug)]
pub struct HostState {
    bindings: Option<Bindings>,
    pub(crate) limiter: SandboxLimiter,
    deadline: Option<Instant>,
}

impl HostState {
    /// Create store data with no bindings installed
    #[must_use]
    pub fn new(limiter: SandboxLimiter) -> Self {
        Self {
            bindings: None,
            limiter,
            deadline: None,
        }
    }

    /// Install the binding set for the coming run
    pub fn bind(&mut self, bindings: Bindings) {
        self.bindings = Some(bindings);
    }

    /// Remove the binding set
    pub fn take_bindings(&mut self) -> Option<Bindings> {
        self.bindings.take()
    }

    /// Installed binding set, if any
    #[must_use]
    pub fn bindings(&self) -> Option<&Bindings> {
        self.bindings.as_ref()
    }

    /// Set the wall-clock deadline host calls check
    pub fn arm_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// The store's resource limiter
    #[must_use]
    pub fn limiter(&self) -> &SandboxLimiter {
        &self.limiter
    }

    fn bound(&self) -> Result<&Bindings, HostTrap> {
        self.bindings.as_ref().ok_or(HostTrap::Unbound)
    }

    fn bound_mut(&mut self) -> Result<&mut Bindings, HostTrap> {
        self.bindings.as_mut().ok_or(HostTrap::Unbound)
    }
}

/// Errors raised by host functions that end the run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostTrap {
    /// Script reached outside the surface
    #[error(transparent)]
    Violation(#[from] BindingViolation),

    /// Wall-clock deadline passed before or during a host call
    #[error("wall-clock budget exceeded in host call")]
    DeadlineExceeded,

    /// Not enough fuel left to pay for a host call
    #[error(transparent)]
    OutOfFuel(#[from] FuelError),

    /// Out-of-bounds pointer, negative length, or missing memory export
    #[error("guest memory access failed: {0}")]
    GuestMemory(String),

    /// Host call made before bindings were installed
    #[error("host call made with no bindings installed")]
    Unbound,
}

enum CallError {
    Code(ErrorCode),
    Trap(HostTrap),
}

impl From<ErrorCode> for CallError {
    fn from(code: ErrorCode) -> Self {
        Self::Code(code)
    }
}

impl From<HostTrap> for CallError {
    fn from(trap: HostTrap) -> Self {
        Self::Trap(trap)
    }
}

impl From<SurfaceError> for CallError {
    fn from(err: SurfaceError) -> Self {
        match err {
            SurfaceError::Code(code) => Self::Code(code),
            SurfaceError::Violation(violation) => Self::Trap(HostTrap::Violation(violation)),
        }
    }
}

fn finish(result: Result<i32, CallError>) -> wasmtime::Result<i32> {
    match result {
        Ok(n) => Ok(n),
        Err(CallError::Code(code)) => Ok(code.as_i32()),
        Err(CallError::Trap(trap)) => Err(wasmtime::Error::new(trap)),
    }
}

/// Void imports swallow script-visible codes; traps still end the run
fn finish_void(result: Result<(), CallError>) -> wasmtime::Result<()> {
    match result {
        Ok(()) | Err(CallError::Code(_)) => Ok(()),
        Err(CallError::Trap(trap)) => Err(wasmtime::Error::new(trap)),
    }
}

/// Register every binding surface import on `linker`
///
/// # Errors
///
/// Returns error if an import is already defined
pub fn install(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "field_get",
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         out_ptr: i32,
         out_cap: i32| {
            finish(field_get(&mut caller, key_ptr, key_len, out_ptr, out_cap))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "field_set",
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         val_ptr: i32,
         val_len: i32| {
            finish(field_set(&mut caller, key_ptr, key_len, val_ptr, val_len))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "field_del",
        |mut caller: Caller<'_, HostState>, key_ptr: i32, key_len: i32| {
            finish(field_del(&mut caller, key_ptr, key_len))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "object_attr",
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         attr_ptr: i32,
         attr_len: i32,
         out_ptr: i32,
         out_cap: i32| {
            finish(object_attr(
                &mut caller,
                (key_ptr, key_len),
                (attr_ptr, attr_len),
                (out_ptr, out_cap),
            ))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "bucket_attr",
        |mut caller: Caller<'_, HostState>,
         attr_ptr: i32,
         attr_len: i32,
         out_ptr: i32,
         out_cap: i32| {
            finish(bucket_attr(&mut caller, attr_ptr, attr_len, out_ptr, out_cap))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "log",
        |mut caller: Caller<'_, HostState>,
         event_ptr: i32,
         event_len: i32,
         fields_ptr: i32,
         fields_len: i32| {
            finish_void(log(&mut caller, event_ptr, event_len, fields_ptr, fields_len))
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "ops_log",
        |mut caller: Caller<'_, HostState>| finish(ops_log(&mut caller)),
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "debug",
        |mut caller: Caller<'_, HostState>, msg_ptr: i32, msg_len: i32| {
            finish_void(debug(&mut caller, msg_ptr, msg_len))
        },
    )?;
    Ok(())
}

/// Deadline check, call accounting and fuel charge common to every import
fn enter(caller: &mut Caller<'_, HostState>, import: &str) -> Result<(), HostTrap> {
    let state = caller.data_mut();
    if let Some(deadline) = state.deadline {
        if Instant::now() >= deadline {
            return Err(HostTrap::DeadlineExceeded);
        }
    }
    state.bound_mut()?.record_host_call();
    let cost = lookup(import).map_or(0, |import| import.fuel_cost);
    charge_fuel(caller, cost)
}

fn charge_fuel(caller: &mut Caller<'_, HostState>, cost: u64) -> Result<(), HostTrap> {
    // Stores built without fuel metering report an error here; nothing to charge.
    let Ok(remaining) = caller.get_fuel() else {
        return Ok(());
    };
    let Some(left) = remaining.checked_sub(cost) else {
        set_fuel(caller, 0)?;
        return Err(FuelError::OutOfFuel {
            requested: cost,
            remaining,
        }
        .into());
    };
    set_fuel(caller, left)
}

fn set_fuel(caller: &mut Caller<'_, HostState>, fuel: u64) -> Result<(), HostTrap> {
    caller
        .set_fuel(fuel)
        .map_err(|err| HostTrap::from(FuelError::Metering(err.to_string())))
}

fn limits(caller: &Caller<'_, HostState>) -> Result<BindingLimits, HostTrap> {
    Ok(caller.data().bound()?.limits().clone())
}

fn guest_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, HostTrap> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or_else(|| {
            HostTrap::GuestMemory(format!("script does not export `{}`", MEMORY_EXPORT))
        })
}

/// Copy `len` bytes at `ptr` out of guest memory; over `max` is an invalid value
fn read_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
    max: usize,
) -> Result<Vec<u8>, CallError> {
    let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(HostTrap::GuestMemory("negative pointer or length".into()).into());
    };
    if len > max {
        return Err(ErrorCode::InvalidValue.into());
    }
    let memory = guest_memory(caller)?;
    let data = memory.data(&*caller);
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            HostTrap::GuestMemory(format!("range {}+{} out of bounds", start, len))
        })?;
    Ok(data[start..end].to_vec())
}

fn read_str(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
    max: usize,
) -> Result<String, CallError> {
    let bytes = read_bytes(caller, ptr, len, max)?;
    String::from_utf8(bytes).map_err(|_| ErrorCode::InvalidValue.into())
}

/// Copy `value` into the guest buffer; returns the byte count written
fn write_out(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    cap: i32,
    value: &[u8],
) -> Result<i32, CallError> {
    let (Ok(start), Ok(cap)) = (usize::try_from(ptr), usize::try_from(cap)) else {
        return Err(HostTrap::GuestMemory("negative pointer or capacity".into()).into());
    };
    if value.len() > cap {
        return Err(ErrorCode::BufferTooSmall.into());
    }
    let written = i32::try_from(value.len()).map_err(|_| ErrorCode::TooLarge)?;
    let memory = guest_memory(caller)?;
    memory
        .write(&mut *caller, start, value)
        .map_err(|err| HostTrap::GuestMemory(err.to_string()))?;
    Ok(written)
}

fn field_get(
    caller: &mut Caller<'_, HostState>,
    key_ptr: i32,
    key_len: i32,
    out_ptr: i32,
    out_cap: i32,
) -> Result<i32, CallError> {
    enter(caller, "field_get")?;
    let limits = limits(caller)?;
    let key = read_str(caller, key_ptr, key_len, limits.max_key_bytes)?;
    let value = caller.data().bound()?.get_field(&key)?;
    write_out(caller, out_ptr, out_cap, value.as_bytes())
}

fn field_set(
    caller: &mut Caller<'_, HostState>,
    key_ptr: i32,
    key_len: i32,
    val_ptr: i32,
    val_len: i32,
) -> Result<i32, CallError> {
    enter(caller, "field_set")?;
    let limits = limits(caller)?;
    let key = read_str(caller, key_ptr, key_len, limits.max_key_bytes)?;
    let value = read_str(caller, val_ptr, val_len, limits.max_value_bytes)?;
    caller.data_mut().bound_mut()?.set_field(&key, &value)?;
    Ok(0)
}

fn field_del(
    caller: &mut Caller<'_, HostState>,
    key_ptr: i32,
    key_len: i32,
) -> Result<i32, CallError> {
    enter(caller, "field_del")?;
    let limits = limits(caller)?;
    let key = read_str(caller, key_ptr, key_len, limits.max_key_bytes)?;
    caller.data_mut().bound_mut()?.del_field(&key)?;
    Ok(0)
}

fn object_attr(
    caller: &mut Caller<'_, HostState>,
    (key_ptr, key_len): (i32, i32),
    (attr_ptr, attr_len): (i32, i32),
    (out_ptr, out_cap): (i32, i32),
) -> Result<i32, CallError> {
    enter(caller, "object_attr")?;
    let limits = limits(caller)?;
    let key = read_str(caller, key_ptr, key_len, limits.max_value_bytes)?;
    let attr = read_str(caller, attr_ptr, attr_len, limits.max_key_bytes)?;
    let value = caller.data_mut().bound_mut()?.object_attr(&key, &attr)?;
    write_out(caller, out_ptr, out_cap, value.as_bytes())
}

fn bucket_attr(
    caller: &mut Caller<'_, HostState>,
    attr_ptr: i32,
    attr_len: i32,
    out_ptr: i32,
    out_cap: i32,
) -> Result<i32, CallError> {
    enter(caller, "bucket_attr")?;
    let limits = limits(caller)?;
    let attr = read_str(caller, attr_ptr, attr_len, limits.max_key_bytes)?;
    let value = caller.data_mut().bound_mut()?.bucket_attr(&attr)?;
    write_out(caller, out_ptr, out_cap, value.as_bytes())
}

fn log(
    caller: &mut Caller<'_, HostState>,
    event_ptr: i32,
    event_len: i32,
    fields_ptr: i32,
    fields_len: i32,
) -> Result<(), CallError> {
    enter(caller, "log")?;
    let limits = limits(caller)?;
    let event = read_str(caller, event_ptr, event_len, limits.max_key_bytes)?;
    let fields = read_str(caller, fields_ptr, fields_len, limits.max_value_bytes)?;
    caller.data_mut().bound_mut()?.log(&event, &fields)?;
    Ok(())
}

fn ops_log(caller: &mut Caller<'_, HostState>) -> Result<i32, CallError> {
    enter(caller, "ops_log")?;
    caller.data_mut().bound_mut()?.ops_log()?;
    Ok(0)
}

fn debug(caller: &mut Caller<'_, HostState>, msg_ptr: i32, msg_len: i32) -> Result<(), CallError> {
    enter(caller, "debug")?;
    let limits = limits(caller)?;
    let message = read_str(caller, msg_ptr, msg_len, limits.max_value_bytes)?;
    caller.data().bound()?.debug(&message)?;
    Ok(())
}

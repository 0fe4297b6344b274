//! SLUICE Core Types
//!
//! This crate contains pure types and logic with no I/O: content hashes,
//! hook points, capabilities, request state, and the storage metadata
//! interface the script bridge consumes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod capability;
pub mod error;
pub mod hash;
pub mod hook;
pub mod request;
pub mod store;

// Re-exports
pub use capability::{Capability, CapabilitySet};
pub use error::{CoreError, CoreResult};
pub use hash::{Hash, ScriptSource};
pub use hook::HookPoint;
pub use request::{Dialect, Identity, RequestState, ResponseState, RestContext};
pub use store::{MemoryMetadataStore, MetadataStore, StoreError};

//! The binding surface ABI.
//!
//! Scripts are WebAssembly modules. The only functions they may import are
//! the ones listed in [`SURFACE`], all under the [`IMPORT_MODULE`] namespace,
//! all taking and returning `i32`. Strings are passed as `(ptr, len)` pairs
//! into the script's exported [`MEMORY_EXPORT`] memory.

use sluice_core::Capability;
use std::fmt;

/// Import namespace of the binding surface
pub const IMPORT_MODULE: &str = "gateway";

/// Exported entry point every script must define
pub const ENTRY_POINT: &str = "run";

/// Exported linear memory the host reads arguments from
pub const MEMORY_EXPORT: &str = "memory";

/// Binding surface version; bumped on any change to [`SURFACE`] or field paths
pub const ABI_VERSION: semver::Version = semver::Version::new(1, 0, 0);

/// One host import of the binding surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostImport {
    /// Import name under [`IMPORT_MODULE`]
    pub name: &'static str,
    /// Number of `i32` parameters
    pub params: usize,
    /// Number of `i32` results (0 or 1)
    pub results: usize,
    /// Capability the import belongs to
    pub capability: Capability,
    /// Fuel charged on every call, on top of the script's own instructions
    pub fuel_cost: u64,
}

/// Every import a script may declare
pub const SURFACE: [HostImport; 8] = [
    HostImport {
        name: "field_get",
        params: 4,
        results: 1,
        capability: Capability::RequestRead,
        fuel_cost: 50,
    },
    HostImport {
        name: "field_set",
        params: 4,
        results: 1,
        capability: Capability::RequestWrite,
        fuel_cost: 100,
    },
    HostImport {
        name: "field_del",
        params: 2,
        results: 1,
        capability: Capability::RequestWrite,
        fuel_cost: 100,
    },
    HostImport {
        name: "object_attr",
        params: 6,
        results: 1,
        capability: Capability::ObjectMetadata,
        fuel_cost: 1_000,
    },
    HostImport {
        name: "bucket_attr",
        params: 4,
        results: 1,
        capability: Capability::BucketMetadata,
        fuel_cost: 1_000,
    },
    HostImport {
        name: "log",
        params: 4,
        results: 0,
        capability: Capability::Log,
        fuel_cost: 200,
    },
    HostImport {
        name: "ops_log",
        params: 0,
        results: 1,
        capability: Capability::OpsLog,
        fuel_cost: 200,
    },
    HostImport {
        name: "debug",
        params: 2,
        results: 0,
        capability: Capability::Debug,
        fuel_cost: 50,
    },
];

/// Look up a surface import by name
#[must_use]
pub fn lookup(name: &str) -> Option<&'static HostImport> {
    SURFACE.iter().find(|import| import.name == name)
}

/// Error values returned to scripts by surface calls
///
/// Non-negative return values are byte counts; these are the negative ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Field, header, object or attribute does not exist
    NotFound,
    /// Output buffer is smaller than the value
    BufferTooSmall,
    /// Value rejected (bad number, bad header token, oversize argument)
    InvalidValue,
    /// Per-run limit reached (staged bytes, storage calls, log records)
    LimitReached,
    /// Storage collaborator failed
    StorageUnavailable,
    /// Storage collaborator did not answer in time
    StorageTimeout,
    /// Storage result exceeds the configured size bound
    TooLarge,
}

impl ErrorCode {
    /// Every code, in numeric order from -1 downwards
    pub const ALL: [ErrorCode; 7] = [
        Self::NotFound,
        Self::BufferTooSmall,
        Self::InvalidValue,
        Self::LimitReached,
        Self::StorageUnavailable,
        Self::StorageTimeout,
        Self::TooLarge,
    ];

    /// Value handed to the script
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::NotFound => -1,
            Self::BufferTooSmall => -2,
            Self::InvalidValue => -3,
            Self::LimitReached => -4,
            Self::StorageUnavailable => -5,
            Self::StorageTimeout => -6,
            Self::TooLarge => -7,
        }
    }

    /// Parse a script-visible value back into a code
    #[must_use]
    pub fn from_i32(value: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_i32() == value)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::BufferTooSmall => "buffer too small",
            Self::InvalidValue => "invalid value",
            Self::LimitReached => "limit reached",
            Self::StorageUnavailable => "storage unavailable",
            Self::StorageTimeout => "storage timeout",
            Self::TooLarge => "too large",
        };
        write!(f, "{} ({})", name, self.as_i32())
    }
}

/// Shape of an import a compiled script declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportShape {
    /// A function import
    Func {
        /// Parameter count
        params: usize,
        /// Result count
        results: usize,
        /// Whether every parameter and result is `i32`
        all_i32: bool,
    },
    /// A memory, table or global import (never part of the surface)
    Other(&'static str),
}

/// One import declared by a compiled script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDecl {
    /// Import module name
    pub module: String,
    /// Import field name
    pub name: String,
    /// Declared shape
    pub shape: ImportShape,
}

impl ImportDecl {
    /// `module::name`, for diagnostics
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }
}

/// A script reached for something outside the binding surface
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("binding violation on `{capability}`: {detail}")]
pub struct BindingViolation {
    /// What was attempted (import, field path or capability name)
    pub capability: String,
    /// Why it was refused
    pub detail: String,
}

impl BindingViolation {
    /// Create a violation
    #[must_use]
    pub fn new(capability: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            detail: detail.into(),
        }
    }

    /// Import not in the surface
    #[must_use]
    pub fn unknown_import(decl: &ImportDecl) -> Self {
        Self::new(decl.qualified(), "import is not part of the binding surface")
    }

    /// Field path not in the surface
    #[must_use]
    pub fn unknown_field(key: &str) -> Self {
        Self::new(format!("field:{}", key), "unknown field")
    }

    /// Write to a read-only field
    #[must_use]
    pub fn read_only(key: &str) -> Self {
        Self::new(format!("field:{}", key), "field is read-only")
    }

    /// Capability not granted at this hook
    #[must_use]
    pub fn not_granted(capability: Capability) -> Self {
        Self::new(capability.kind_name(), "capability not granted at this hook")
    }
}

/// Check one declared import against the surface
///
/// # Errors
///
/// Returns a violation if the import is not in [`SURFACE`] or its signature
/// differs from the surface's
pub fn check_import(decl: &ImportDecl) -> Result<&'static HostImport, BindingViolation> {
    if decl.module != IMPORT_MODULE {
        return Err(BindingViolation::unknown_import(decl));
    }
    let import = lookup(&decl.name).ok_or_else(|| BindingViolation::unknown_import(decl))?;
    match decl.shape {
        ImportShape::Func {
            params,
            results,
            all_i32: true,
        } if params == import.params && results == import.results => Ok(import),
        ImportShape::Func { .. } => Err(BindingViolation::new(
            decl.qualified(),
            format!(
                "signature mismatch: expected {} i32 params and {} i32 results",
                import.params, import.results
            ),
        )),
        ImportShape::Other(kind) => Err(BindingViolation::new(
            decl.qualified(),
            format!("{} imports are not part of the binding surface", kind),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(module: &str, name: &str, params: usize, results: usize) -> ImportDecl {
        ImportDecl {
            module: module.to_string(),
            name: name.to_string(),
            shape: ImportShape::Func {
                params,
                results,
                all_i32: true,
            },
        }
    }

    #[test]
    fn test_surface_names_unique() {
        for (i, a) in SURFACE.iter().enumerate() {
            for b in &SURFACE[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn test_lookup() {
        let import = lookup("object_attr").unwrap();
        assert_eq!(import.params, 6);
        assert_eq!(import.capability, Capability::ObjectMetadata);
        assert!(lookup("fs_open").is_none());
    }

    #[test]
    fn test_error_codes_roundtrip() {
        for code in ErrorCode::ALL {
            assert!(code.as_i32() < 0);
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ErrorCode::from_i32(0), None);
    }

    #[test]
    fn test_check_import_accepts_surface() {
        assert!(check_import(&func("gateway", "field_set", 4, 1)).is_ok());
        assert!(check_import(&func("gateway", "log", 4, 0)).is_ok());
    }

    #[test]
    fn test_check_import_rejects_unknown() {
        let err = check_import(&func("gateway", "socket_open", 2, 1)).unwrap_err();
        assert_eq!(err.capability, "gateway::socket_open");

        let err = check_import(&func("wasi_snapshot_preview1", "fd_write", 4, 1)).unwrap_err();
        assert!(err.detail.contains("not part of the binding surface"));
    }

    #[test]
    fn test_check_import_rejects_signature() {
        let err = check_import(&func("gateway", "field_get", 2, 1)).unwrap_err();
        assert!(err.detail.contains("signature mismatch"));
    }

    #[test]
    fn test_check_import_rejects_memory_import() {
        let decl = ImportDecl {
            module: "gateway".to_string(),
            name: "field_get".to_string(),
            shape: ImportShape::Other("memory"),
        };
        assert!(check_import(&decl).is_err());
    }

    #[test]
    fn test_abi_version() {
        assert_eq!(ABI_VERSION.to_string(), "1.0.0");
    }
}

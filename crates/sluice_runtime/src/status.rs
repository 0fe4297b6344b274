//! Status codes returned to the gateway and the failure policy over them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Script ran and its writes were committed
pub const STATUS_OK: i32 = 0;
/// Script failed to compile
pub const STATUS_COMPILE_ERROR: i32 = -100;
/// Script trapped or returned a failure
pub const STATUS_RUNTIME_ERROR: i32 = -200;
/// Fuel or wall-clock budget exhausted
pub const STATUS_TIMEOUT: i32 = -201;
/// Linear memory limit hit while running
pub const STATUS_MEMORY_LIMIT: i32 = -202;
/// Script reached outside the binding surface
pub const STATUS_BINDING_VIOLATION: i32 = -300;
/// No sandbox could be set up
pub const STATUS_RESOURCE_INIT: i32 = -400;
/// Operation name does not name a hook
pub const STATUS_INVALID_HOOK: i32 = -500;

/// Outcome category of one bridge invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCategory {
    /// Committed
    Success,
    /// Compilation failed
    CompileError,
    /// Trap or script-raised failure
    RuntimeError,
    /// Budget exhausted
    Timeout,
    /// Memory limit hit during the run
    MemoryLimit,
    /// Binding surface violation
    BindingViolation,
    /// Sandbox setup failed
    ResourceInit,
    /// Malformed op name
    InvalidHook,
}

impl StatusCategory {
    /// Every category, in code order
    pub const ALL: [StatusCategory; 8] = [
        Self::Success,
        Self::CompileError,
        Self::RuntimeError,
        Self::Timeout,
        Self::MemoryLimit,
        Self::BindingViolation,
        Self::ResourceInit,
        Self::InvalidHook,
    ];

    /// Status code handed back to the gateway
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => STATUS_OK,
            Self::CompileError => STATUS_COMPILE_ERROR,
            Self::RuntimeError => STATUS_RUNTIME_ERROR,
            Self::Timeout => STATUS_TIMEOUT,
            Self::MemoryLimit => STATUS_MEMORY_LIMIT,
            Self::BindingViolation => STATUS_BINDING_VIOLATION,
            Self::ResourceInit => STATUS_RESOURCE_INIT,
            Self::InvalidHook => STATUS_INVALID_HOOK,
        }
    }

    /// Map a status code back to its category
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Name used in log records and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::CompileError => "compile_error",
            Self::RuntimeError => "runtime_error",
            Self::Timeout => "timeout",
            Self::MemoryLimit => "memory_limit",
            Self::BindingViolation => "binding_violation",
            Self::ResourceInit => "resource_init",
            Self::InvalidHook => "invalid_hook",
        }
    }

    /// Whether a run in this category could have executed script code
    #[must_use]
    pub const fn ran(self) -> bool {
        matches!(
            self,
            Self::Success | Self::RuntimeError | Self::Timeout | Self::MemoryLimit
        )
    }

    /// Timeouts and memory limits are runtime errors too
    #[must_use]
    pub const fn is_runtime_error(self) -> bool {
        matches!(self, Self::RuntimeError | Self::Timeout | Self::MemoryLimit)
    }
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the gateway does with a request whose script failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Proceed without the script's effects
    Open,
    /// Reject the request
    Closed,
}

/// Per-category fail-open / fail-closed table
///
/// The bridge never consults this; it is here so the gateway can keep the
/// decision next to the rest of the script configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    /// Mode for categories without an override
    pub default_mode: FailureMode,
    /// Per-category overrides
    pub overrides: BTreeMap<StatusCategory, FailureMode>,
}

impl FailurePolicy {
    /// Fail open for everything
    #[must_use]
    pub fn new() -> Self {
        Self {
            default_mode: FailureMode::Open,
            overrides: BTreeMap::new(),
        }
    }

    /// Fail closed for everything
    #[must_use]
    pub fn closed() -> Self {
        Self {
            default_mode: FailureMode::Closed,
            overrides: BTreeMap::new(),
        }
    }

    /// Override one category
    #[must_use]
    pub fn with(mut self, category: StatusCategory, mode: FailureMode) -> Self {
        self.overrides.insert(category, mode);
        self
    }

    /// Mode for a category; success is always open
    #[must_use]
    pub fn mode_for(&self, category: StatusCategory) -> FailureMode {
        if category == StatusCategory::Success {
            return FailureMode::Open;
        }
        self.overrides
            .get(&category)
            .copied()
            .unwrap_or(self.default_mode)
    }

    /// Mode for a status code returned by the bridge
    ///
    /// Unknown codes take the default mode.
    #[must_use]
    pub fn decide(&self, code: i32) -> FailureMode {
        match StatusCategory::from_code(code) {
            Some(category) => self.mode_for(category),
            None => self.default_mode,
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_codes_round_trip_through_category() {
        for category in StatusCategory::ALL {
            assert_eq!(StatusCategory::from_code(category.code()), Some(category));
        }
        assert_eq!(StatusCategory::from_code(-1), None);
        assert_eq!(StatusCategory::from_code(7), None);
    }

    #[test]
    fn test_code_values() {
        assert_eq!(StatusCategory::Success.code(), 0);
        assert_eq!(StatusCategory::CompileError.code(), -100);
        assert_eq!(StatusCategory::Timeout.code(), -201);
        assert_eq!(StatusCategory::BindingViolation.code(), -300);
        assert_eq!(StatusCategory::InvalidHook.code(), -500);
    }

    #[test]
    fn test_runtime_error_family() {
        assert!(StatusCategory::Timeout.is_runtime_error());
        assert!(StatusCategory::MemoryLimit.is_runtime_error());
        assert!(!StatusCategory::CompileError.is_runtime_error());
        assert!(!StatusCategory::BindingViolation.ran());
    }

    #[test]
    fn test_policy_defaults_open() {
        let policy = FailurePolicy::default();
        assert_eq!(policy.decide(STATUS_TIMEOUT), FailureMode::Open);
        assert_eq!(policy.decide(12345), FailureMode::Open);
    }

    #[test]
    fn test_policy_overrides() {
        let policy = FailurePolicy::new()
            .with(StatusCategory::BindingViolation, FailureMode::Closed);
        assert_eq!(policy.decide(STATUS_BINDING_VIOLATION), FailureMode::Closed);
        assert_eq!(policy.decide(STATUS_COMPILE_ERROR), FailureMode::Open);

        let closed = FailurePolicy::closed();
        assert_eq!(closed.decide(STATUS_OK), FailureMode::Open);
        assert_eq!(closed.decide(STATUS_RESOURCE_INIT), FailureMode::Closed);
    }

    #[test]
    fn test_policy_json_keys_are_category_names() {
        let policy = FailurePolicy::new().with(StatusCategory::Timeout, FailureMode::Closed);
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"timeout\":\"closed\""));
        let back: FailurePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    fn category() -> impl Strategy<Value = StatusCategory> {
        proptest::sample::select(StatusCategory::ALL.to_vec())
    }

    fn mode() -> impl Strategy<Value = FailureMode> {
        prop_oneof![Just(FailureMode::Open), Just(FailureMode::Closed)]
    }

    proptest! {
        #[test]
        fn prop_known_codes_map_back(code in any::<i32>()) {
            match StatusCategory::from_code(code) {
                Some(category) => {
                    prop_assert_eq!(category.code(), code);
                }
                None => {
                    prop_assert!(StatusCategory::ALL.iter().all(|c| c.code() != code));
                }
            }
        }

        #[test]
        fn prop_success_is_always_open(
            default_mode in mode(),
            overrides in proptest::collection::btree_map(category(), mode(), 0..8),
        ) {
            let policy = FailurePolicy { default_mode, overrides };
            prop_assert_eq!(policy.decide(STATUS_OK), FailureMode::Open);
        }

        #[test]
        fn prop_decide_follows_overrides(
            default_mode in mode(),
            overrides in proptest::collection::btree_map(category(), mode(), 0..8),
            code in prop_oneof![category().prop_map(StatusCategory::code), any::<i32>()],
        ) {
            let policy = FailurePolicy { default_mode, overrides: overrides.clone() };
            let expected = match StatusCategory::from_code(code) {
                Some(StatusCategory::Success) => FailureMode::Open,
                Some(category) => overrides.get(&category).copied().unwrap_or(default_mode),
                None => default_mode,
            };
            prop_assert_eq!(policy.decide(code), expected);
        }
    }
}

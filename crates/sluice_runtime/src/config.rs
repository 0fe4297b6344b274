//! Bridge configuration.

use serde::{Deserialize, Serialize};
use sluice_core::{CapabilitySet, CoreError, CoreResult, HookPoint};
use sluice_wasm::{BindingLimits, CacheConfig, PoolConfig, SandboxConfig};
use std::collections::BTreeMap;

use crate::status::FailurePolicy;

/// Everything the host bridge needs to set itself up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Per-run sandbox budgets and memory limit
    pub sandbox: SandboxConfig,
    /// Compilation cache
    pub cache: CacheConfig,
    /// Sandbox pool
    pub pool: PoolConfig,
    /// Per-run binding surface limits
    pub limits: BindingLimits,
    /// Fail-open / fail-closed table for the gateway
    pub policy: FailurePolicy,
    /// Capabilities granted at hooks without an entry in `hook_capabilities`
    pub capabilities: CapabilitySet,
    /// Capabilities by canonical hook name
    pub hook_capabilities: BTreeMap<String, CapabilitySet>,
}

impl BridgeConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            limits: BindingLimits::default(),
            policy: FailurePolicy::default(),
            capabilities: CapabilitySet::all(),
            hook_capabilities: BTreeMap::new(),
        }
    }

    /// Parse from JSON and validate
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or fails [`Self::validate`]
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the sandbox config
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Set the cache config
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the pool config
    #[must_use]
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the binding limits
    #[must_use]
    pub fn with_limits(mut self, limits: BindingLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the failure policy
    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the default capability set
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Grant `capabilities` at `hook` instead of the default set
    #[must_use]
    pub fn with_hook_capabilities(mut self, hook: &HookPoint, capabilities: CapabilitySet) -> Self {
        self.hook_capabilities
            .insert(hook.as_str().to_string(), capabilities);
        self
    }

    /// Capabilities a script gets at `hook`
    #[must_use]
    pub fn capabilities_for(&self, hook: &HookPoint) -> &CapabilitySet {
        self.hook_capabilities
            .get(hook.as_str())
            .unwrap_or(&self.capabilities)
    }

    /// Validate the configuration
    ///
    /// The memory limit is not checked here; a limit below one page surfaces
    /// as a resource-initialization failure on every run.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first bad field
    pub fn validate(&self) -> CoreResult<()> {
        self.sandbox
            .validate()
            .map_err(|err| invalid("sandbox", err.to_string()))?;
        if self.cache.capacity == 0 {
            return Err(invalid("cache.capacity", "must be > 0"));
        }
        if self.cache.compile.max_script_bytes == 0 {
            return Err(invalid("cache.compile.max_script_bytes", "must be > 0"));
        }
        if self.pool.size == 0 {
            return Err(invalid("pool.size", "must be > 0"));
        }
        if self.limits.max_key_bytes == 0 {
            return Err(invalid("limits.max_key_bytes", "must be > 0"));
        }
        if self.limits.max_value_bytes > self.limits.max_staged_bytes {
            return Err(invalid(
                "limits.max_value_bytes",
                "must not exceed limits.max_staged_bytes",
            ));
        }
        for name in self.hook_capabilities.keys() {
            let hook = HookPoint::parse(name)
                .map_err(|err| invalid("hook_capabilities", err.to_string()))?;
            if hook.as_str() != name {
                return Err(invalid(
                    "hook_capabilities",
                    format!("'{}' is not a canonical hook name, use '{}'", name, hook.as_str()),
                ));
            }
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> CoreError {
    CoreError::Validation {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{FailureMode, StatusCategory};
    use sluice_core::Capability;

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.capabilities_for(&HookPoint::PreRequest).has(Capability::RequestWrite));
    }

    #[test]
    fn test_from_json_partial() {
        let config = BridgeConfig::from_json(
            r#"{
                "sandbox": { "fuel_budget": 5000 },
                "pool": { "size": 4 },
                "policy": { "overrides": { "binding_violation": "closed" } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.fuel_budget, 5000);
        assert_eq!(
            config.sandbox.wall_clock_budget_ms,
            SandboxConfig::default().wall_clock_budget_ms
        );
        assert_eq!(config.pool.size, 4);
        assert_eq!(
            config.policy.mode_for(StatusCategory::BindingViolation),
            FailureMode::Closed
        );
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(BridgeConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn test_validate_names_field() {
        let config = BridgeConfig::new().with_pool(PoolConfig::new().with_size(0));
        match config.validate() {
            Err(CoreError::Validation { field, .. }) => assert_eq!(field, "pool.size"),
            other => panic!("unexpected: {:?}", other),
        }

        let config = BridgeConfig::new().with_sandbox(SandboxConfig::new().with_fuel_budget(0));
        match config.validate() {
            Err(CoreError::Validation { field, .. }) => assert_eq!(field, "sandbox"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_low_memory_limit_passes_validation() {
        let config = BridgeConfig::new().with_sandbox(SandboxConfig::new().with_memory_limit(1024));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hook_capabilities() {
        let config = BridgeConfig::new()
            .with_hook_capabilities(&HookPoint::PostRequest, CapabilitySet::read_only());
        assert!(config.validate().is_ok());
        let post = config.capabilities_for(&HookPoint::PostRequest);
        assert!(!post.has(Capability::RequestWrite));
        assert!(post.has(Capability::Log));
        assert!(config.capabilities_for(&HookPoint::PreRequest).has(Capability::RequestWrite));
    }

    #[test]
    fn test_non_canonical_hook_name_rejected() {
        let mut config = BridgeConfig::new();
        config
            .hook_capabilities
            .insert("before-request".to_string(), CapabilitySet::read_only());
        assert!(config.validate().is_err());
    }
}

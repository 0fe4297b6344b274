//! Capability types for the script binding surface.
//!
//! Every host import a script can reach belongs to exactly one capability.
//! A hook is granted a [`CapabilitySet`]; calling an import whose capability is
//! not granted is a binding violation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A capability grants access to one slice of the binding surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read request, response and identity fields
    RequestRead,
    /// Stage writes to response fields, user metadata and the abort flag
    RequestWrite,
    /// Query object metadata through the storage collaborator
    ObjectMetadata,
    /// Query bucket metadata through the storage collaborator
    BucketMetadata,
    /// Append structured records to the log sink
    Log,
    /// Emit the request's ops-log summary record
    OpsLog,
    /// Write operator debug lines into the gateway's tracing output
    Debug,
}

impl Capability {
    /// Every capability, in declaration order
    pub const ALL: [Capability; 7] = [
        Self::RequestRead,
        Self::RequestWrite,
        Self::ObjectMetadata,
        Self::BucketMetadata,
        Self::Log,
        Self::OpsLog,
        Self::Debug,
    ];

    /// Get a string representation of the capability kind
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::RequestRead => "request_read",
            Self::RequestWrite => "request_write",
            Self::ObjectMetadata => "object_metadata",
            Self::BucketMetadata => "bucket_metadata",
            Self::Log => "log",
            Self::OpsLog => "ops_log",
            Self::Debug => "debug",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_name())
    }
}

/// A set of capabilities granted to a hook invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// Create a new empty capability set
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: BTreeSet::new(),
        }
    }

    /// Create a set holding every capability
    #[must_use]
    pub fn all() -> Self {
        Self {
            capabilities: Capability::ALL.into_iter().collect(),
        }
    }

    /// Create a set that can only observe: request reads and logging
    #[must_use]
    pub fn read_only() -> Self {
        Self::new()
            .with(Capability::RequestRead)
            .with(Capability::Log)
            .with(Capability::Debug)
    }

    /// Grant a capability
    pub fn grant(&mut self, capability: Capability) {
        self.capabilities.insert(capability);
    }

    /// Revoke a capability
    pub fn revoke(&mut self, capability: Capability) {
        self.capabilities.remove(&capability);
    }

    /// Grant a capability, builder style
    #[must_use]
    pub fn with(mut self, capability: Capability) -> Self {
        self.grant(capability);
        self
    }

    /// Revoke a capability, builder style
    #[must_use]
    pub fn without(mut self, capability: Capability) -> Self {
        self.revoke(capability);
        self
    }

    /// Check if a capability is granted
    #[must_use]
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Get the number of capabilities
    #[must_use]
    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Iterate over capabilities
    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            capabilities: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_grant() {
        let mut caps = CapabilitySet::new();
        assert!(caps.is_empty());

        caps.grant(Capability::Log);
        assert_eq!(caps.len(), 1);
        assert!(caps.has(Capability::Log));
        assert!(!caps.has(Capability::RequestWrite));
    }

    #[test]
    fn test_capability_set_default_is_all() {
        let caps = CapabilitySet::default();
        assert_eq!(caps.len(), Capability::ALL.len());
        for cap in Capability::ALL {
            assert!(caps.has(cap));
        }
    }

    #[test]
    fn test_read_only_set() {
        let caps = CapabilitySet::read_only();
        assert!(caps.has(Capability::RequestRead));
        assert!(!caps.has(Capability::RequestWrite));
        assert!(!caps.has(Capability::ObjectMetadata));
    }

    #[test]
    fn test_revoke() {
        let caps = CapabilitySet::all().without(Capability::ObjectMetadata);
        assert!(!caps.has(Capability::ObjectMetadata));
        assert!(caps.has(Capability::BucketMetadata));
    }

    #[test]
    fn test_serde_names() {
        let caps = CapabilitySet::new().with(Capability::OpsLog);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"["ops_log"]"#);
        let parsed: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, caps);
    }
}

//! Content hashes for script sources.
//!
//! Uses BLAKE3 for all hashing operations. A script's identity is the hash of
//! its source bytes, so identical text always maps to the same cache key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A BLAKE3 hash (256 bits / 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Compute BLAKE3 hash of data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Immutable script source text, addressed by its content hash
///
/// Cloning is cheap; the bytes are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    bytes: Arc<[u8]>,
    hash: Hash,
}

impl ScriptSource {
    /// Create a source from raw bytes
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        let hash = Hash::compute(&bytes);
        Self { bytes, hash }
    }

    /// Create a source from script text
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        Self::new(text.as_bytes())
    }

    /// Content hash (the source's identity)
    #[must_use]
    pub const fn hash(&self) -> Hash {
        self.hash
    }

    /// Source bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Source length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the source is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<&str> for ScriptSource {
    fn from(text: &str) -> Self {
        Self::from_text(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_compute() {
        let hash = Hash::compute(b"hello world");
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn test_hash_short() {
        let hash = Hash::compute(b"x");
        assert_eq!(hash.short().len(), 12);
        assert!(hash.to_hex().starts_with(&hash.short()));
    }

    #[test]
    fn test_script_source_identity() {
        let a = ScriptSource::from_text("(module)");
        let b = ScriptSource::from("(module)");
        let c = ScriptSource::from_text("(module )");
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.len(), 8);
        assert!(!a.is_empty());
    }

    proptest! {
        #[test]
        fn prop_same_bytes_same_hash(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let a = ScriptSource::new(data.clone());
            let b = ScriptSource::new(data);
            prop_assert_eq!(a.hash(), b.hash());
        }
    }
}

//! Read-only storage metadata interface.
//!
//! The storage engine is an external collaborator. Scripts reach it only
//! through [`MetadataStore`], which answers single-attribute queries. Any
//! network wait is bounded by the implementation; failures come back as
//! [`StoreError`] values and are handed to the script as error codes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;

/// Storage query error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Object, bucket or attribute does not exist
    NotFound,
    /// The storage collaborator did not answer in time
    Timeout,
    /// The storage collaborator failed
    Unavailable { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "Not found"),
            Self::Timeout => write!(f, "Storage query timed out"),
            Self::Unavailable { reason } => write!(f, "Storage unavailable: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Metadata queries a script may issue against the storage engine
pub trait MetadataStore: Send + Sync {
    /// Look up one attribute of an object (e.g. `size`, `etag`, `mtime`)
    ///
    /// # Errors
    ///
    /// Returns error if the object or attribute is missing or storage fails
    fn object_attribute(&self, bucket: &str, key: &str, attr: &str) -> Result<String, StoreError>;

    /// Look up one attribute of a bucket (e.g. `owner`, `count`, `size`)
    ///
    /// # Errors
    ///
    /// Returns error if the bucket or attribute is missing or storage fails
    fn bucket_attribute(&self, bucket: &str, attr: &str) -> Result<String, StoreError>;
}

/// In-memory metadata store, for tests and embedding without a backend
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    objects: RwLock<BTreeMap<(String, String), BTreeMap<String, String>>>,
    buckets: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MemoryMetadataStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an object attribute
    pub fn put_object_attribute(&self, bucket: &str, key: &str, attr: &str, value: &str) {
        if let Ok(mut objects) = self.objects.write() {
            objects
                .entry((bucket.to_string(), key.to_string()))
                .or_default()
                .insert(attr.to_string(), value.to_string());
        }
    }

    /// Set a bucket attribute
    pub fn put_bucket_attribute(&self, bucket: &str, attr: &str, value: &str) {
        if let Ok(mut buckets) = self.buckets.write() {
            buckets
                .entry(bucket.to_string())
                .or_default()
                .insert(attr.to_string(), value.to_string());
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn object_attribute(&self, bucket: &str, key: &str, attr: &str) -> Result<String, StoreError> {
        let objects = self.objects.read().map_err(|_| StoreError::Unavailable {
            reason: "lock poisoned".to_string(),
        })?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|attrs| attrs.get(attr))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn bucket_attribute(&self, bucket: &str, attr: &str) -> Result<String, StoreError> {
        let buckets = self.buckets.read().map_err(|_| StoreError::Unavailable {
            reason: "lock poisoned".to_string(),
        })?;
        buckets
            .get(bucket)
            .and_then(|attrs| attrs.get(attr))
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

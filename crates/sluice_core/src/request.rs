//! Request and response state owned by the gateway.
//!
//! [`RequestState`] is the mutable object the gateway hands to the bridge at a
//! hook point. Scripts never touch it directly; they see a snapshot and stage
//! writes that are committed only when a run succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Headers that are never visible to scripts, whatever the protocol context says
pub const SENSITIVE_HEADERS: [&str; 4] = [
    "authorization",
    "cookie",
    "x-amz-security-token",
    "x-auth-token",
];

/// Authenticated identity of the requester
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// User id
    pub user: String,
    /// Tenant the user belongs to (empty for the default tenant)
    pub tenant: String,
}

impl Identity {
    /// Create an identity
    #[must_use]
    pub fn new(user: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            tenant: tenant.into(),
        }
    }
}

/// Response fields produced by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseState {
    /// HTTP status code
    pub status_code: u16,
    /// HTTP status text
    pub status: String,
    /// Gateway-internal result code
    pub rgw_code: i32,
    /// Error/informational message
    pub message: String,
    /// Response headers
    pub headers: BTreeMap<String, String>,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self {
            status_code: 200,
            status: "OK".to_string(),
            rgw_code: 0,
            message: String::new(),
            headers: BTreeMap::new(),
        }
    }
}

/// The mutable request/response object of one client request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestState {
    /// Transaction id assigned by the gateway
    pub trans_id: String,
    /// HTTP method
    pub method: String,
    /// Decoded request path
    pub path: String,
    /// Raw query string
    pub query_string: String,
    /// Parsed query parameters
    pub query: BTreeMap<String, String>,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Host the request was addressed to
    pub host: String,
    /// Content length, if declared
    pub content_length: Option<u64>,
    /// Time the request was received
    pub time: Option<DateTime<Utc>>,
    /// Target bucket
    pub bucket: Option<String>,
    /// Target object key
    pub object: Option<String>,
    /// Requester identity
    pub identity: Identity,
    /// User-defined object metadata
    pub metadata: BTreeMap<String, String>,
    /// Abort flag the gateway checks after the hook
    pub abort: bool,
    /// Response fields
    pub response: ResponseState,
}

impl RequestState {
    /// Create a request state for a method and path
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            trans_id: String::new(),
            method: method.into(),
            path: path.into(),
            query_string: String::new(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            host: String::new(),
            content_length: None,
            time: None,
            bucket: None,
            object: None,
            identity: Identity::default(),
            metadata: BTreeMap::new(),
            abort: false,
            response: ResponseState::default(),
        }
    }

    /// Set the transaction id
    #[must_use]
    pub fn with_trans_id(mut self, trans_id: impl Into<String>) -> Self {
        self.trans_id = trans_id.into();
        self
    }

    /// Set the bucket
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object key
    #[must_use]
    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    /// Set the identity
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Add a request header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter (also appended to the raw query string)
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        if !self.query_string.is_empty() {
            self.query_string.push('&');
        }
        self.query_string.push_str(&format!("{}={}", name, value));
        self.query.insert(name, value);
        self
    }

    /// Set the host
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// Look up a map entry by key, ignoring ASCII case
#[must_use]
pub fn get_ignore_case<'a>(map: &'a BTreeMap<String, String>, name: &str) -> Option<&'a String> {
    map.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// Insert into a map, replacing any entry whose key differs only in case
pub fn insert_ignore_case(map: &mut BTreeMap<String, String>, name: &str, value: String) {
    remove_ignore_case(map, name);
    map.insert(name.to_string(), value);
}

/// Remove every entry whose key matches ignoring ASCII case
pub fn remove_ignore_case(map: &mut BTreeMap<String, String>, name: &str) {
    map.retain(|key, _| !key.eq_ignore_ascii_case(name));
}

/// Wire dialect of the request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// S3 REST API
    #[default]
    S3,
    /// Swift REST API
    Swift,
}

impl Dialect {
    /// Name as exposed to scripts
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "S3",
            Self::Swift => "Swift",
        }
    }
}

/// Protocol-layer context; shapes what the request view exposes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestContext {
    /// Wire dialect
    pub dialect: Dialect,
    /// Request headers visible to scripts (lowercase). `None` exposes every
    /// non-sensitive header.
    pub exposed_headers: Option<BTreeSet<String>>,
}

impl RestContext {
    /// Create a context for a dialect exposing all non-sensitive headers
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            exposed_headers: None,
        }
    }

    /// Restrict visible headers to an allowlist
    #[must_use]
    pub fn with_exposed_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.exposed_headers = Some(
            headers
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Whether a request header may be shown to scripts
    #[must_use]
    pub fn exposes_header(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        if SENSITIVE_HEADERS.contains(&lower.as_str()) {
            return false;
        }
        match &self.exposed_headers {
            Some(allowed) => allowed.contains(&lower),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = RequestState::new("PUT", "/photos/cat.jpg")
            .with_bucket("photos")
            .with_object("cat.jpg")
            .with_query("versionId", "3")
            .with_query("acl", "")
            .with_header("Content-Type", "image/jpeg");
        assert_eq!(req.bucket.as_deref(), Some("photos"));
        assert_eq!(req.query_string, "versionId=3&acl=");
        assert_eq!(req.response.status_code, 200);
        assert!(!req.abort);
    }

    #[test]
    fn test_get_ignore_case() {
        let req = RequestState::new("GET", "/").with_header("Content-Type", "text/plain");
        assert_eq!(
            get_ignore_case(&req.headers, "content-type").map(String::as_str),
            Some("text/plain")
        );
        assert!(get_ignore_case(&req.headers, "accept").is_none());
    }

    #[test]
    fn test_insert_ignore_case_replaces() {
        let mut map = BTreeMap::new();
        map.insert("X-Tag".to_string(), "a".to_string());
        insert_ignore_case(&mut map, "x-tag", "b".to_string());
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("x-tag").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_sensitive_headers_hidden() {
        let rest = RestContext::default();
        assert!(rest.exposes_header("Content-Type"));
        assert!(!rest.exposes_header("Authorization"));
        assert!(!rest.exposes_header("COOKIE"));
    }

    #[test]
    fn test_exposed_header_allowlist() {
        let rest = RestContext::new(Dialect::Swift).with_exposed_headers(["Content-Type"]);
        assert!(rest.exposes_header("content-type"));
        assert!(!rest.exposes_header("x-custom"));
        assert_eq!(rest.dialect.as_str(), "Swift");
    }
}

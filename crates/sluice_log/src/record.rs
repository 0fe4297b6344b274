//! Structured log records.
//!
//! A record is an event name plus a map of JSON fields, stamped with the
//! request it belongs to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Record severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Operator debugging
    Debug,
    /// Normal event
    Info,
    /// Degraded but handled
    Warn,
    /// Failed operation
    Error,
    /// Security-relevant event (capability misuse)
    Security,
}

impl Severity {
    /// Lowercase name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Security => "security",
        }
    }

    /// Whether the record reports a failure
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Security)
    }
}

/// Who produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSource {
    /// Emitted by a script through the `log` binding
    Script,
    /// Ops-log summary requested by a script
    OpsLog,
    /// Emitted by the bridge itself (outcome reports)
    Bridge,
}

/// A structured log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// When the record was created
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub severity: Severity,
    /// Producer
    pub source: RecordSource,
    /// Event name
    pub event: String,
    /// Transaction id of the request
    pub trans_id: String,
    /// Operation name the hook ran at
    pub op: String,
    /// Structured payload
    pub fields: BTreeMap<String, Value>,
}

impl LogRecord {
    /// Create an info record
    pub fn new(source: RecordSource, event: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity: Severity::Info,
            source,
            event: event.into(),
            trans_id: String::new(),
            op: String::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Set the severity
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Stamp with the request's transaction id and op name
    pub fn with_request(mut self, trans_id: impl Into<String>, op: impl Into<String>) -> Self {
        self.trans_id = trans_id.into();
        self.op = op.into();
        self
    }

    /// Add one field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Merge a field map
    pub fn with_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Look up a field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Whether the record reports a failure
    pub fn is_error(&self) -> bool {
        self.severity.is_error()
    }

    /// Render as a single JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"event\":{:?}}}", self.event))
    }
}

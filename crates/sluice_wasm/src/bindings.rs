//! Per-request binding set.
//!
//! [`Bindings`] is the only thing a script can see or touch. It holds a
//! private snapshot of the request, the capabilities granted at the hook, and
//! every write the script has staged. Staged writes become visible to the
//! script's own reads immediately but reach the real request only through
//! [`StagedMutations::apply`], which the engine calls after a successful run.

use crate::abi::{ABI_VERSION, BindingViolation, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_core::request::{get_ignore_case, insert_ignore_case, remove_ignore_case};
use sluice_core::{
    Capability, CapabilitySet, HookPoint, MetadataStore, RequestState, RestContext, StoreError,
};
use sluice_log::{LogRecord, LogSink, RecordSource, Severity};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Longest event name a script log record keeps
pub const MAX_EVENT_LEN: usize = 128;

/// A parsed field path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPath<'a> {
    /// `hook`
    Hook,
    /// `op`
    Op,
    /// `abi.version`
    AbiVersion,
    /// `method`
    Method,
    /// `path`
    Path,
    /// `query_string`
    QueryString,
    /// `query.<name>`
    Query(&'a str),
    /// `header.<name>`
    Header(&'a str),
    /// `host`
    Host,
    /// `content_length`
    ContentLength,
    /// `dialect`
    Dialect,
    /// `trans_id`
    TransId,
    /// `time` (RFC 3339)
    Time,
    /// `bucket`
    Bucket,
    /// `object`
    Object,
    /// `user.id`
    UserId,
    /// `user.tenant`
    UserTenant,
    /// `response.status_code`
    ResponseStatusCode,
    /// `response.status`
    ResponseStatus,
    /// `response.rgw_code`
    ResponseRgwCode,
    /// `response.message`
    ResponseMessage,
    /// `response.header.<name>`
    ResponseHeader(&'a str),
    /// `metadata.<name>`
    Metadata(&'a str),
    /// `abort`
    Abort,
}

impl<'a> FieldPath<'a> {
    /// Parse a dotted field path; `None` if it names nothing
    #[must_use]
    pub fn parse(key: &'a str) -> Option<Self> {
        let field = match key {
            "hook" => Self::Hook,
            "op" => Self::Op,
            "abi.version" => Self::AbiVersion,
            "method" => Self::Method,
            "path" => Self::Path,
            "query_string" => Self::QueryString,
            "host" => Self::Host,
            "content_length" => Self::ContentLength,
            "dialect" => Self::Dialect,
            "trans_id" => Self::TransId,
            "time" => Self::Time,
            "bucket" => Self::Bucket,
            "object" => Self::Object,
            "user.id" => Self::UserId,
            "user.tenant" => Self::UserTenant,
            "response.status_code" => Self::ResponseStatusCode,
            "response.status" => Self::ResponseStatus,
            "response.rgw_code" => Self::ResponseRgwCode,
            "response.message" => Self::ResponseMessage,
            "abort" => Self::Abort,
            _ => {
                let (field, name) = if let Some(name) = key.strip_prefix("query.") {
                    (Self::Query(name), name)
                } else if let Some(name) = key.strip_prefix("header.") {
                    (Self::Header(name), name)
                } else if let Some(name) = key.strip_prefix("response.header.") {
                    (Self::ResponseHeader(name), name)
                } else if let Some(name) = key.strip_prefix("metadata.") {
                    (Self::Metadata(name), name)
                } else {
                    return None;
                };
                if name.is_empty() {
                    return None;
                }
                field
            }
        };
        Some(field)
    }

    /// Whether scripts may write this field
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        matches!(
            self,
            Self::ResponseStatusCode
                | Self::ResponseStatus
                | Self::ResponseRgwCode
                | Self::ResponseMessage
                | Self::ResponseHeader(_)
                | Self::Metadata(_)
                | Self::Abort
        )
    }

    /// Whether this field is an entry of a map (and so may be deleted)
    #[must_use]
    pub const fn is_map_entry(&self) -> bool {
        matches!(self, Self::ResponseHeader(_) | Self::Metadata(_))
    }
}

/// Per-run bounds on what a script may consume through the surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingLimits {
    /// Longest field path or attribute name accepted
    pub max_key_bytes: usize,
    /// Longest value accepted by a write, or logged by `debug`
    pub max_value_bytes: usize,
    /// Total key and value bytes a run may stage
    pub max_staged_bytes: usize,
    /// Storage queries per run
    pub max_storage_calls: u32,
    /// Log and ops-log records per run
    pub max_log_records: u32,
    /// Longest storage attribute value handed back
    pub max_attr_bytes: usize,
}

impl BindingLimits {
    /// Create default limits
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_key_bytes: 256,
            max_value_bytes: 8 * 1024,
            max_staged_bytes: 64 * 1024,
            max_storage_calls: 16,
            max_log_records: 32,
            max_attr_bytes: 4 * 1024,
        }
    }

    /// Set the storage call bound
    #[must_use]
    pub fn with_storage_calls(mut self, calls: u32) -> Self {
        self.max_storage_calls = calls;
        self
    }

    /// Set the log record bound
    #[must_use]
    pub fn with_log_records(mut self, records: u32) -> Self {
        self.max_log_records = records;
        self
    }

    /// Set the staged byte bound
    #[must_use]
    pub fn with_staged_bytes(mut self, bytes: usize) -> Self {
        self.max_staged_bytes = bytes;
        self
    }
}

impl Default for BindingLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Staged writes to one map (response headers or metadata)
///
/// Names compare ignoring ASCII case; the last write to a name wins and keeps
/// its spelling. `None` stages a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedMap {
    entries: BTreeMap<String, (String, Option<String>)>,
}

impl StagedMap {
    fn stage(&mut self, name: &str, value: Option<String>) {
        self.entries
            .insert(name.to_ascii_lowercase(), (name.to_string(), value));
    }

    /// Staged state of a name: `Some(None)` is a staged delete
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Option<&str>> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_deref())
    }

    /// Number of staged names
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is staged
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn apply_to(self, map: &mut BTreeMap<String, String>) {
        for (_, (name, value)) in self.entries {
            match value {
                Some(value) => insert_ignore_case(map, &name, value),
                None => remove_ignore_case(map, &name),
            }
        }
    }
}

/// Every write a run has staged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedMutations {
    /// `response.status_code`
    pub status_code: Option<u16>,
    /// `response.status`
    pub status: Option<String>,
    /// `response.rgw_code`
    pub rgw_code: Option<i32>,
    /// `response.message`
    pub message: Option<String>,
    /// `response.header.*`
    pub response_headers: StagedMap,
    /// `metadata.*`
    pub metadata: StagedMap,
    /// `abort`
    pub abort: Option<bool>,
}

impl StagedMutations {
    /// Number of staged fields
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.status_code.is_some())
            + usize::from(self.status.is_some())
            + usize::from(self.rgw_code.is_some())
            + usize::from(self.message.is_some())
            + usize::from(self.abort.is_some())
            + self.response_headers.len()
            + self.metadata.len()
    }

    /// Whether nothing is staged
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every staged change into the request
    pub fn apply(self, request: &mut RequestState) {
        if let Some(code) = self.status_code {
            request.response.status_code = code;
        }
        if let Some(status) = self.status {
            request.response.status = status;
        }
        if let Some(code) = self.rgw_code {
            request.response.rgw_code = code;
        }
        if let Some(message) = self.message {
            request.response.message = message;
        }
        if let Some(abort) = self.abort {
            request.abort = abort;
        }
        self.response_headers.apply_to(&mut request.response.headers);
        self.metadata.apply_to(&mut request.metadata);
    }
}

/// What a surface call returns instead of a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    /// Handed to the script as a negative return value
    Code(ErrorCode),
    /// Aborts the run
    Violation(BindingViolation),
}

impl From<ErrorCode> for SurfaceError {
    fn from(code: ErrorCode) -> Self {
        Self::Code(code)
    }
}

impl From<BindingViolation> for SurfaceError {
    fn from(violation: BindingViolation) -> Self {
        Self::Violation(violation)
    }
}

/// Result of a surface call
pub type SurfaceResult<T> = Result<T, SurfaceError>;

/// Counters for one run's use of the surface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingUsage {
    /// Surface calls made
    pub host_calls: u32,
    /// Key and value bytes staged
    pub staged_bytes: usize,
    /// Storage queries issued
    pub storage_calls: u32,
    /// Records emitted
    pub log_records: u32,
    /// Records refused over the limit
    pub log_dropped: u32,
}

/// The binding set for one invocation
pub struct Bindings {
    hook: HookPoint,
    op_name: String,
    request: RequestState,
    rest: RestContext,
    capabilities: CapabilitySet,
    limits: BindingLimits,
    store: Arc<dyn MetadataStore>,
    log: Arc<dyn LogSink>,
    staged: StagedMutations,
    usage: BindingUsage,
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("hook", &self.hook)
            .field("op_name", &self.op_name)
            .field("trans_id", &self.request.trans_id)
            .field("capabilities", &self.capabilities)
            .field("staged", &self.staged)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

impl Bindings {
    /// Build a binding set over a snapshot of `request`
    ///
    /// Every capability is granted; narrow with [`Self::with_capabilities`].
    #[must_use]
    pub fn new(
        hook: HookPoint,
        op_name: impl Into<String>,
        request: &RequestState,
        rest: &RestContext,
        store: Arc<dyn MetadataStore>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            hook,
            op_name: op_name.into(),
            request: request.clone(),
            rest: rest.clone(),
            capabilities: CapabilitySet::all(),
            limits: BindingLimits::default(),
            store,
            log,
            staged: StagedMutations::default(),
            usage: BindingUsage::default(),
        }
    }

    /// Restrict the granted capabilities
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set per-run limits
    #[must_use]
    pub fn with_limits(mut self, limits: BindingLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Hook this run serves
    #[must_use]
    pub fn hook(&self) -> &HookPoint {
        &self.hook
    }

    /// Operation name the gateway passed
    #[must_use]
    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    /// Request transaction id
    #[must_use]
    pub fn trans_id(&self) -> &str {
        &self.request.trans_id
    }

    /// Granted capabilities
    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Per-run limits
    #[must_use]
    pub fn limits(&self) -> &BindingLimits {
        &self.limits
    }

    /// Writes staged so far
    #[must_use]
    pub fn staged(&self) -> &StagedMutations {
        &self.staged
    }

    /// Surface usage so far
    #[must_use]
    pub fn usage(&self) -> BindingUsage {
        self.usage
    }

    /// Consume the binding set, keeping only the staged writes
    #[must_use]
    pub fn into_staged(self) -> StagedMutations {
        self.staged
    }

    /// Count one host call
    pub fn record_host_call(&mut self) {
        self.usage.host_calls = self.usage.host_calls.saturating_add(1);
    }

    /// Fail unless `capability` is granted
    ///
    /// # Errors
    ///
    /// Returns a violation naming the capability
    pub fn require(&self, capability: Capability) -> Result<(), BindingViolation> {
        if self.capabilities.has(capability) {
            Ok(())
        } else {
            Err(BindingViolation::not_granted(capability))
        }
    }

    /// Read a field; staged writes shadow the snapshot
    ///
    /// # Errors
    ///
    /// `NotFound` if the field has no value, a violation if the path is unknown
    pub fn get_field(&self, key: &str) -> SurfaceResult<String> {
        self.require(Capability::RequestRead)?;
        let field = FieldPath::parse(key).ok_or_else(|| BindingViolation::unknown_field(key))?;
        self.read(field).ok_or(SurfaceError::Code(ErrorCode::NotFound))
    }

    fn read(&self, field: FieldPath<'_>) -> Option<String> {
        let request = &self.request;
        let response = &request.response;
        match field {
            FieldPath::Hook => Some(self.hook.as_str().to_string()),
            FieldPath::Op => Some(self.op_name.clone()),
            FieldPath::AbiVersion => Some(ABI_VERSION.to_string()),
            FieldPath::Method => Some(request.method.clone()),
            FieldPath::Path => Some(request.path.clone()),
            FieldPath::QueryString => Some(request.query_string.clone()),
            FieldPath::Query(name) => get_ignore_case(&request.query, name).cloned(),
            FieldPath::Header(name) => {
                if self.rest.exposes_header(name) {
                    get_ignore_case(&request.headers, name).cloned()
                } else {
                    None
                }
            }
            FieldPath::Host => Some(request.host.clone()),
            FieldPath::ContentLength => request.content_length.map(|n| n.to_string()),
            FieldPath::Dialect => Some(self.rest.dialect.as_str().to_string()),
            FieldPath::TransId => Some(request.trans_id.clone()),
            FieldPath::Time => request.time.map(|t| t.to_rfc3339()),
            FieldPath::Bucket => request.bucket.clone(),
            FieldPath::Object => request.object.clone(),
            FieldPath::UserId => Some(request.identity.user.clone()),
            FieldPath::UserTenant => Some(request.identity.tenant.clone()),
            FieldPath::ResponseStatusCode => Some(
                self.staged
                    .status_code
                    .unwrap_or(response.status_code)
                    .to_string(),
            ),
            FieldPath::ResponseStatus => Some(
                self.staged
                    .status
                    .clone()
                    .unwrap_or_else(|| response.status.clone()),
            ),
            FieldPath::ResponseRgwCode => {
                Some(self.staged.rgw_code.unwrap_or(response.rgw_code).to_string())
            }
            FieldPath::ResponseMessage => Some(
                self.staged
                    .message
                    .clone()
                    .unwrap_or_else(|| response.message.clone()),
            ),
            FieldPath::ResponseHeader(name) => match self.staged.response_headers.lookup(name) {
                Some(staged) => staged.map(str::to_string),
                None => get_ignore_case(&response.headers, name).cloned(),
            },
            FieldPath::Metadata(name) => match self.staged.metadata.lookup(name) {
                Some(staged) => staged.map(str::to_string),
                None => get_ignore_case(&request.metadata, name).cloned(),
            },
            FieldPath::Abort => Some(self.staged.abort.unwrap_or(request.abort).to_string()),
        }
    }

    /// Stage a write
    ///
    /// # Errors
    ///
    /// `InvalidValue` for a malformed value, `LimitReached` once the staged
    /// byte bound is hit, a violation for unknown or read-only fields
    pub fn set_field(&mut self, key: &str, value: &str) -> SurfaceResult<()> {
        self.require(Capability::RequestWrite)?;
        let field = FieldPath::parse(key).ok_or_else(|| BindingViolation::unknown_field(key))?;
        if !field.is_writable() {
            return Err(BindingViolation::read_only(key).into());
        }
        if value.len() > self.limits.max_value_bytes || !is_clean_value(value) {
            return Err(ErrorCode::InvalidValue.into());
        }
        match field {
            FieldPath::ResponseStatusCode => {
                let code = value
                    .trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|code| (100..=599).contains(code))
                    .ok_or(ErrorCode::InvalidValue)?;
                self.charge_staged(key, value)?;
                self.staged.status_code = Some(code);
            }
            FieldPath::ResponseStatus => {
                self.charge_staged(key, value)?;
                self.staged.status = Some(value.to_string());
            }
            FieldPath::ResponseRgwCode => {
                let code = value
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| ErrorCode::InvalidValue)?;
                self.charge_staged(key, value)?;
                self.staged.rgw_code = Some(code);
            }
            FieldPath::ResponseMessage => {
                self.charge_staged(key, value)?;
                self.staged.message = Some(value.to_string());
            }
            FieldPath::ResponseHeader(name) => {
                if !is_token(name) {
                    return Err(ErrorCode::InvalidValue.into());
                }
                self.charge_staged(key, value)?;
                self.staged
                    .response_headers
                    .stage(name, Some(value.to_string()));
            }
            FieldPath::Metadata(name) => {
                if !is_token(name) {
                    return Err(ErrorCode::InvalidValue.into());
                }
                self.charge_staged(key, value)?;
                self.staged.metadata.stage(name, Some(value.to_string()));
            }
            FieldPath::Abort => {
                let abort = match value.trim() {
                    "true" | "1" => true,
                    "false" | "0" => false,
                    _ => return Err(ErrorCode::InvalidValue.into()),
                };
                self.charge_staged(key, value)?;
                self.staged.abort = Some(abort);
            }
            _ => return Err(BindingViolation::read_only(key).into()),
        }
        Ok(())
    }

    /// Stage the removal of a response header or metadata entry
    ///
    /// # Errors
    ///
    /// `NotFound` if the entry does not exist, a violation for anything that
    /// is not a writable map entry
    pub fn del_field(&mut self, key: &str) -> SurfaceResult<()> {
        self.require(Capability::RequestWrite)?;
        let field = FieldPath::parse(key).ok_or_else(|| BindingViolation::unknown_field(key))?;
        if !field.is_writable() {
            return Err(BindingViolation::read_only(key).into());
        }
        if !field.is_map_entry() {
            return Err(BindingViolation::new(
                format!("field:{}", key),
                "only response headers and metadata entries can be deleted",
            )
            .into());
        }
        if self.read(field).is_none() {
            return Err(ErrorCode::NotFound.into());
        }
        self.charge_staged(key, "")?;
        match field {
            FieldPath::ResponseHeader(name) => self.staged.response_headers.stage(name, None),
            FieldPath::Metadata(name) => self.staged.metadata.stage(name, None),
            _ => {}
        }
        Ok(())
    }

    fn charge_staged(&mut self, key: &str, value: &str) -> SurfaceResult<()> {
        let total = self.usage.staged_bytes + key.len() + value.len();
        if total > self.limits.max_staged_bytes {
            return Err(ErrorCode::LimitReached.into());
        }
        self.usage.staged_bytes = total;
        Ok(())
    }

    /// Query an object attribute; an empty key means the request's object
    ///
    /// # Errors
    ///
    /// Storage failures map to error codes; `LimitReached` once the per-run
    /// storage call bound is hit
    pub fn object_attr(&mut self, key: &str, attr: &str) -> SurfaceResult<String> {
        self.require(Capability::ObjectMetadata)?;
        let bucket = self.request.bucket.clone().ok_or(ErrorCode::NotFound)?;
        let key = if key.is_empty() {
            self.request.object.clone().ok_or(ErrorCode::NotFound)?
        } else {
            key.to_string()
        };
        self.charge_storage_call()?;
        let value = self
            .store
            .object_attribute(&bucket, &key, attr)
            .map_err(|err| self.store_code(err))?;
        self.bound_attr(value)
    }

    /// Query an attribute of the request's bucket
    ///
    /// # Errors
    ///
    /// Same as [`Self::object_attr`]
    pub fn bucket_attr(&mut self, attr: &str) -> SurfaceResult<String> {
        self.require(Capability::BucketMetadata)?;
        let bucket = self.request.bucket.clone().ok_or(ErrorCode::NotFound)?;
        self.charge_storage_call()?;
        let value = self
            .store
            .bucket_attribute(&bucket, attr)
            .map_err(|err| self.store_code(err))?;
        self.bound_attr(value)
    }

    fn charge_storage_call(&mut self) -> SurfaceResult<()> {
        if self.usage.storage_calls >= self.limits.max_storage_calls {
            return Err(ErrorCode::LimitReached.into());
        }
        self.usage.storage_calls += 1;
        Ok(())
    }

    fn store_code(&self, err: StoreError) -> ErrorCode {
        if err != StoreError::NotFound {
            tracing::debug!(
                trans_id = %self.request.trans_id,
                op = %self.op_name,
                error = %err,
                "storage query failed"
            );
        }
        match err {
            StoreError::NotFound => ErrorCode::NotFound,
            StoreError::Timeout => ErrorCode::StorageTimeout,
            StoreError::Unavailable { .. } => ErrorCode::StorageUnavailable,
        }
    }

    fn bound_attr(&self, value: String) -> SurfaceResult<String> {
        if value.len() > self.limits.max_attr_bytes {
            return Err(ErrorCode::TooLarge.into());
        }
        Ok(value)
    }

    /// Emit a script log record straight to the sink
    ///
    /// `fields` is a JSON object; anything else is kept verbatim under `raw`.
    /// A `level` field of `debug`, `warn` or `error` sets the severity.
    ///
    /// # Errors
    ///
    /// `LimitReached` once the per-run record bound is hit
    pub fn log(&mut self, event: &str, fields: &str) -> SurfaceResult<()> {
        self.require(Capability::Log)?;
        self.charge_log_record()?;
        let fields = parse_fields(fields);
        let severity = fields
            .get("level")
            .and_then(Value::as_str)
            .map_or(Severity::Info, |level| match level {
                "debug" => Severity::Debug,
                "warn" | "warning" => Severity::Warn,
                "error" => Severity::Error,
                _ => Severity::Info,
            });
        let record = LogRecord::new(RecordSource::Script, event_name(event))
            .with_severity(severity)
            .with_request(self.request.trans_id.clone(), self.op_name.clone())
            .with_field("hook", self.hook.as_str())
            .with_fields(fields);
        self.log.emit(record);
        Ok(())
    }

    /// Emit an ops-log summary of the request as the script currently sees it
    ///
    /// # Errors
    ///
    /// `LimitReached` once the per-run record bound is hit
    pub fn ops_log(&mut self) -> SurfaceResult<()> {
        self.require(Capability::OpsLog)?;
        self.charge_log_record()?;
        let request = &self.request;
        let status_code = self
            .staged
            .status_code
            .unwrap_or(request.response.status_code);
        let record = LogRecord::new(RecordSource::OpsLog, "ops_log")
            .with_request(request.trans_id.clone(), self.op_name.clone())
            .with_field("hook", self.hook.as_str())
            .with_field("method", request.method.clone())
            .with_field("path", request.path.clone())
            .with_field("host", request.host.clone())
            .with_field("bucket", request.bucket.clone())
            .with_field("object", request.object.clone())
            .with_field("user", request.identity.user.clone())
            .with_field("tenant", request.identity.tenant.clone())
            .with_field("content_length", request.content_length)
            .with_field("status_code", status_code)
            .with_field("dialect", self.rest.dialect.as_str());
        self.log.emit(record);
        Ok(())
    }

    fn charge_log_record(&mut self) -> SurfaceResult<()> {
        if self.usage.log_records >= self.limits.max_log_records {
            self.usage.log_dropped += 1;
            return Err(ErrorCode::LimitReached.into());
        }
        self.usage.log_records += 1;
        Ok(())
    }

    /// Write a diagnostic line to the process's debug output
    ///
    /// # Errors
    ///
    /// A violation if the debug capability is not granted
    pub fn debug(&self, message: &str) -> SurfaceResult<()> {
        self.require(Capability::Debug)?;
        let message = truncate(message, self.limits.max_value_bytes);
        tracing::debug!(
            target: "sluice::script",
            hook = %self.hook,
            op = %self.op_name,
            trans_id = %self.request.trans_id,
            "{}",
            message
        );
        Ok(())
    }
}

/// No control characters that could split a header line
fn is_clean_value(value: &str) -> bool {
    !value.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0))
}

/// HTTP token characters
fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn event_name(event: &str) -> String {
    let event = truncate(event.trim(), MAX_EVENT_LEN);
    if event.is_empty() {
        "script".to_string()
    } else {
        event.to_string()
    }
}

fn parse_fields(text: &str) -> BTreeMap<String, Value> {
    if text.trim().is_empty() {
        return BTreeMap::new();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => BTreeMap::from([("raw".to_string(), Value::from(text))]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{Identity, MemoryMetadataStore};
    use sluice_log::MemorySink;

    fn request() -> RequestState {
        RequestState::new("PUT", "/photos/cat.jpg")
            .with_trans_id("tx-1")
            .with_bucket("photos")
            .with_object("cat.jpg")
            .with_identity(Identity::new("alice", "acme"))
            .with_header("Content-Type", "image/jpeg")
            .with_header("Authorization", "AWS4-HMAC-SHA256 secret")
            .with_query("versionId", "7")
    }

    fn bindings_with(store: MemoryMetadataStore, sink: Arc<MemorySink>) -> Bindings {
        let hook = HookPoint::parse("put_obj").unwrap();
        Bindings::new(
            hook,
            "put_obj",
            &request(),
            &RestContext::default(),
            Arc::new(store),
            sink,
        )
    }

    fn bindings() -> Bindings {
        bindings_with(MemoryMetadataStore::new(), Arc::new(MemorySink::default()))
    }

    fn violation(result: SurfaceResult<impl fmt::Debug>) -> BindingViolation {
        match result {
            Err(SurfaceError::Violation(v)) => v,
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn test_field_path_parse() {
        assert_eq!(FieldPath::parse("method"), Some(FieldPath::Method));
        assert_eq!(
            FieldPath::parse("response.header.X-Processed"),
            Some(FieldPath::ResponseHeader("X-Processed"))
        );
        assert_eq!(FieldPath::parse("header.host"), Some(FieldPath::Header("host")));
        assert_eq!(FieldPath::parse("header."), None);
        assert_eq!(FieldPath::parse("response.body"), None);
        assert_eq!(FieldPath::parse(""), None);
    }

    #[test]
    fn test_field_path_writability() {
        assert!(FieldPath::Abort.is_writable());
        assert!(FieldPath::Metadata("k").is_map_entry());
        assert!(!FieldPath::Method.is_writable());
        assert!(!FieldPath::ResponseStatus.is_map_entry());
    }

    #[test]
    fn test_read_request_fields() {
        let b = bindings();
        assert_eq!(b.get_field("method").unwrap(), "PUT");
        assert_eq!(b.get_field("bucket").unwrap(), "photos");
        assert_eq!(b.get_field("user.tenant").unwrap(), "acme");
        assert_eq!(b.get_field("query.versionId").unwrap(), "7");
        assert_eq!(b.get_field("header.content-type").unwrap(), "image/jpeg");
        assert_eq!(b.get_field("op").unwrap(), "put_obj");
        assert_eq!(b.get_field("hook").unwrap(), "put_obj");
        assert_eq!(b.get_field("dialect").unwrap(), "S3");
        assert_eq!(b.get_field("abi.version").unwrap(), "1.0.0");
        assert_eq!(b.get_field("response.status_code").unwrap(), "200");
    }

    #[test]
    fn test_query_names_ignore_case() {
        let b = bindings();
        assert_eq!(b.get_field("query.versionid").unwrap(), "7");
        assert_eq!(b.get_field("query.VERSIONID").unwrap(), "7");
        assert_eq!(
            b.get_field("query.uploadId"),
            Err(SurfaceError::Code(ErrorCode::NotFound))
        );
    }

    #[test]
    fn test_sensitive_header_hidden() {
        let b = bindings();
        assert_eq!(
            b.get_field("header.authorization"),
            Err(SurfaceError::Code(ErrorCode::NotFound))
        );
    }

    #[test]
    fn test_missing_optional_field() {
        let b = bindings();
        assert_eq!(
            b.get_field("content_length"),
            Err(SurfaceError::Code(ErrorCode::NotFound))
        );
    }

    #[test]
    fn test_unknown_field_is_violation() {
        let b = bindings();
        let v = violation(b.get_field("env.PATH"));
        assert_eq!(v.capability, "field:env.PATH");
    }

    #[test]
    fn test_write_read_only_is_violation() {
        let mut b = bindings();
        let v = violation(b.set_field("method", "DELETE"));
        assert!(v.detail.contains("read-only"));
        assert!(b.staged().is_empty());
    }

    #[test]
    fn test_staged_write_visible_to_reads() {
        let mut b = bindings();
        b.set_field("response.header.X-Processed", "yes").unwrap();
        assert_eq!(b.get_field("response.header.x-processed").unwrap(), "yes");
        b.set_field("response.status_code", "403").unwrap();
        assert_eq!(b.get_field("response.status_code").unwrap(), "403");
        assert_eq!(b.staged().len(), 2);
    }

    #[test]
    fn test_status_code_validation() {
        let mut b = bindings();
        assert_eq!(
            b.set_field("response.status_code", "99"),
            Err(SurfaceError::Code(ErrorCode::InvalidValue))
        );
        assert_eq!(
            b.set_field("response.status_code", "abc"),
            Err(SurfaceError::Code(ErrorCode::InvalidValue))
        );
        assert!(b.staged().is_empty());
    }

    #[test]
    fn test_header_injection_rejected() {
        let mut b = bindings();
        assert_eq!(
            b.set_field("response.header.X-A", "v\r\nSet-Cookie: x"),
            Err(SurfaceError::Code(ErrorCode::InvalidValue))
        );
        assert_eq!(
            b.set_field("response.header.bad name", "v"),
            Err(SurfaceError::Code(ErrorCode::InvalidValue))
        );
    }

    #[test]
    fn test_abort_values() {
        let mut b = bindings();
        b.set_field("abort", "1").unwrap();
        assert_eq!(b.get_field("abort").unwrap(), "true");
        assert_eq!(
            b.set_field("abort", "maybe"),
            Err(SurfaceError::Code(ErrorCode::InvalidValue))
        );
    }

    #[test]
    fn test_delete_semantics() {
        let mut req = request();
        req.response
            .headers
            .insert("X-Old".to_string(), "1".to_string());
        let mut b = Bindings::new(
            HookPoint::PostRequest,
            "postRequest",
            &req,
            &RestContext::default(),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemorySink::default()),
        );
        b.del_field("response.header.x-old").unwrap();
        assert_eq!(
            b.get_field("response.header.X-Old"),
            Err(SurfaceError::Code(ErrorCode::NotFound))
        );
        assert_eq!(
            b.del_field("metadata.absent"),
            Err(SurfaceError::Code(ErrorCode::NotFound))
        );
        let v = violation(b.del_field("response.status"));
        assert!(v.detail.contains("deleted"));

        let staged = b.into_staged();
        staged.apply(&mut req);
        assert!(req.response.headers.is_empty());
    }

    #[test]
    fn test_apply_writes_request() {
        let mut req = request();
        let mut b = bindings();
        b.set_field("response.header.X-Processed", "yes").unwrap();
        b.set_field("metadata.owner", "alice").unwrap();
        b.set_field("response.message", "checked").unwrap();
        b.set_field("response.rgw_code", "-13").unwrap();
        b.into_staged().apply(&mut req);
        assert_eq!(req.response.headers.get("X-Processed").unwrap(), "yes");
        assert_eq!(req.metadata.get("owner").unwrap(), "alice");
        assert_eq!(req.response.message, "checked");
        assert_eq!(req.response.rgw_code, -13);
    }

    #[test]
    fn test_staged_bytes_limit() {
        let mut b = bindings().with_limits(BindingLimits::new().with_staged_bytes(40));
        b.set_field("metadata.a", "0123456789").unwrap();
        assert_eq!(
            b.set_field("metadata.b", "0123456789012345678901234567890"),
            Err(SurfaceError::Code(ErrorCode::LimitReached))
        );
        assert_eq!(b.staged().len(), 1);
    }

    #[test]
    fn test_capability_gating() {
        let mut b = bindings().with_capabilities(CapabilitySet::read_only());
        assert!(b.get_field("method").is_ok());
        let v = violation(b.set_field("response.status", "Nope"));
        assert_eq!(v.capability, Capability::RequestWrite.kind_name());
    }

    #[test]
    fn test_object_attr() {
        let store = MemoryMetadataStore::new();
        store.put_object_attribute("photos", "cat.jpg", "size", "1024");
        let mut b = bindings_with(store, Arc::new(MemorySink::default()));
        assert_eq!(b.object_attr("", "size").unwrap(), "1024");
        assert_eq!(b.object_attr("cat.jpg", "size").unwrap(), "1024");
        assert_eq!(
            b.object_attr("dog.jpg", "size"),
            Err(SurfaceError::Code(ErrorCode::NotFound))
        );
        assert_eq!(b.usage().storage_calls, 3);
    }

    #[test]
    fn test_storage_call_limit() {
        let store = MemoryMetadataStore::new();
        store.put_bucket_attribute("photos", "owner", "alice");
        let mut b = bindings_with(store, Arc::new(MemorySink::default()))
            .with_limits(BindingLimits::new().with_storage_calls(1));
        assert_eq!(b.bucket_attr("owner").unwrap(), "alice");
        assert_eq!(
            b.bucket_attr("owner"),
            Err(SurfaceError::Code(ErrorCode::LimitReached))
        );
    }

    struct FailingStore(StoreError);

    impl MetadataStore for FailingStore {
        fn object_attribute(&self, _: &str, _: &str, _: &str) -> Result<String, StoreError> {
            Err(self.0.clone())
        }

        fn bucket_attribute(&self, _: &str, _: &str) -> Result<String, StoreError> {
            Err(self.0.clone())
        }
    }

    #[test]
    fn test_storage_failures_map_to_codes() {
        let make = |err: StoreError| {
            Bindings::new(
                HookPoint::PreRequest,
                "preRequest",
                &request(),
                &RestContext::default(),
                Arc::new(FailingStore(err)),
                Arc::new(MemorySink::default()),
            )
        };
        assert_eq!(
            make(StoreError::Timeout).bucket_attr("owner"),
            Err(SurfaceError::Code(ErrorCode::StorageTimeout))
        );
        assert_eq!(
            make(StoreError::Unavailable {
                reason: "down".into()
            })
            .object_attr("", "size"),
            Err(SurfaceError::Code(ErrorCode::StorageUnavailable))
        );
    }

    #[test]
    fn test_log_emits_to_sink() {
        let sink = Arc::new(MemorySink::default());
        let mut b = bindings_with(MemoryMetadataStore::new(), sink.clone());
        b.log("quota.check", r#"{"used": 10, "level": "warn"}"#).unwrap();
        b.log("", "not json").unwrap();
        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "quota.check");
        assert_eq!(records[0].severity, Severity::Warn);
        assert_eq!(records[0].trans_id, "tx-1");
        assert_eq!(records[0].field("used"), Some(&Value::from(10)));
        assert_eq!(records[1].event, "script");
        assert_eq!(records[1].field("raw"), Some(&Value::from("not json")));
    }

    #[test]
    fn test_log_record_limit() {
        let sink = Arc::new(MemorySink::default());
        let mut b = bindings_with(MemoryMetadataStore::new(), sink.clone())
            .with_limits(BindingLimits::new().with_log_records(1));
        b.log("a", "{}").unwrap();
        assert_eq!(
            b.ops_log(),
            Err(SurfaceError::Code(ErrorCode::LimitReached))
        );
        assert_eq!(sink.len(), 1);
        assert_eq!(b.usage().log_dropped, 1);
    }

    #[test]
    fn test_ops_log_reflects_staged_status() {
        let sink = Arc::new(MemorySink::default());
        let mut b = bindings_with(MemoryMetadataStore::new(), sink.clone());
        b.set_field("response.status_code", "404").unwrap();
        b.ops_log().unwrap();
        let record = &sink.records_named("ops_log")[0];
        assert_eq!(record.source, RecordSource::OpsLog);
        assert_eq!(record.field("status_code"), Some(&Value::from(404)));
        assert_eq!(record.field("bucket"), Some(&Value::from("photos")));
    }

    #[test]
    fn test_snapshot_isolated_from_source() {
        let mut req = request();
        let b = bindings();
        req.method = "GET".to_string();
        assert_eq!(b.get_field("method").unwrap(), "PUT");
    }

    proptest::proptest! {
        #[test]
        fn test_map_entry_paths_parse(name in "[A-Za-z0-9_-]{1,32}") {
            let key = format!("metadata.{}", name);
            let field = FieldPath::parse(&key);
            proptest::prop_assert_eq!(field, Some(FieldPath::Metadata(name.as_str())));
            proptest::prop_assert!(field.is_some_and(|f| f.is_writable() && f.is_map_entry()));
        }

        #[test]
        fn test_header_reads_never_writable(name in "[A-Za-z0-9_-]{1,32}") {
            let key = format!("header.{}", name);
            let field = FieldPath::parse(&key);
            proptest::prop_assert!(field.is_some_and(|f| !f.is_writable()));
        }

        #[test]
        fn test_parse_arbitrary_keys(key in ".{0,64}") {
            if let Some(field) = FieldPath::parse(&key) {
                if field.is_writable() {
                    proptest::prop_assert!(
                        key.starts_with("response.")
                            || key.starts_with("metadata.")
                            || key == "abort"
                    );
                }
            }
        }
    }

    #[test]
    fn test_truncate_char_boundary() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 8), "abc");
    }
}

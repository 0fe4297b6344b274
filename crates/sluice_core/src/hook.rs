//! Hook points in the request pipeline.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of an operation name
pub const MAX_OP_NAME_LEN: usize = 64;

/// Where in request processing a script runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookPoint {
    /// Before the request is validated and dispatched
    PreRequest,
    /// After the response has been produced
    PostRequest,
    /// A named operation (e.g. `put_obj`, `list_bucket`)
    Operation(String),
}

impl HookPoint {
    /// Resolve a hook point from the operation name the gateway passes in
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty, too long, or contains characters
    /// outside `[A-Za-z0-9_.-]`
    pub fn parse(op_name: &str) -> CoreResult<Self> {
        match op_name {
            "preRequest" | "before-request" | "pre_request" => return Ok(Self::PreRequest),
            "postRequest" | "after-request" | "post_request" => return Ok(Self::PostRequest),
            _ => {}
        }

        if op_name.is_empty() {
            return Err(CoreError::InvalidHook {
                name: String::new(),
                reason: "empty operation name".to_string(),
            });
        }
        if op_name.len() > MAX_OP_NAME_LEN {
            return Err(CoreError::InvalidHook {
                name: op_name.chars().take(MAX_OP_NAME_LEN).collect(),
                reason: format!("longer than {} bytes", MAX_OP_NAME_LEN),
            });
        }
        if let Some(bad) = op_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(CoreError::InvalidHook {
                name: op_name.to_string(),
                reason: format!("invalid character {:?}", bad),
            });
        }

        Ok(Self::Operation(op_name.to_string()))
    }

    /// Canonical name, as exposed to scripts through the `hook` field
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PreRequest => "preRequest",
            Self::PostRequest => "postRequest",
            Self::Operation(name) => name,
        }
    }

    /// Whether the response has already been produced at this point
    #[must_use]
    pub fn is_post_response(&self) -> bool {
        matches!(self, Self::PostRequest)
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_context_names() {
        assert_eq!(HookPoint::parse("preRequest").unwrap(), HookPoint::PreRequest);
        assert_eq!(HookPoint::parse("before-request").unwrap(), HookPoint::PreRequest);
        assert_eq!(HookPoint::parse("postRequest").unwrap(), HookPoint::PostRequest);
        assert_eq!(HookPoint::parse("after-request").unwrap(), HookPoint::PostRequest);
    }

    #[test]
    fn test_parse_operation() {
        let hook = HookPoint::parse("put_obj").unwrap();
        assert_eq!(hook, HookPoint::Operation("put_obj".to_string()));
        assert_eq!(hook.as_str(), "put_obj");
        assert!(!hook.is_post_response());
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(
            HookPoint::parse(""),
            Err(CoreError::InvalidHook { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_bad_chars() {
        assert!(HookPoint::parse("put obj").is_err());
        assert!(HookPoint::parse("../etc").is_err());
        assert!(HookPoint::parse("op\n").is_err());
    }

    #[test]
    fn test_parse_rejects_long_name() {
        let name = "a".repeat(MAX_OP_NAME_LEN + 1);
        assert!(HookPoint::parse(&name).is_err());
        let name = "a".repeat(MAX_OP_NAME_LEN);
        assert!(HookPoint::parse(&name).is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(HookPoint::PostRequest.to_string(), "postRequest");
    }
}

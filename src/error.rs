//! Crate-wide error type.
//!
//! Mirrors the three client-visible error kinds from the design: invalid
//! queries, upstream (backend) failures, and schema mismatches encountered
//! while merging two backends' field models. Stale-schema detection is
//! handled internally (rebind + cache drop) and never surfaces here.

use std::fmt;

/// Errors returned by the public operations of [`crate::coordinator::Coordinator`].
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    /// A malformed query term, unknown field/sort/collection, or an
    /// out-of-range page.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A backend responded with a non-2xx status.
    #[error("upstream failure ({status}){}", detail_suffix(.detail))]
    Upstream {
        status: u16,
        detail: Option<serde_json::Value>,
    },

    /// Two backends' columns disagree on a field that must match exactly
    /// during schema merge (see the merge rules table in the design).
    #[error("schema mismatch on `{field}`: {detail}")]
    SchemaMismatch { field: String, detail: String },
}

fn detail_suffix(detail: &Option<serde_json::Value>) -> String {
    match detail {
        Some(d) => format!(": {d}"),
        None => String::new(),
    }
}

impl ProxyError {
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        ProxyError::InvalidQuery(msg.into())
    }

    pub fn schema_mismatch(field: impl Into<String>, detail: impl Into<String>) -> Self {
        ProxyError::SchemaMismatch {
            field: field.into(),
            detail: detail.into(),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::Upstream {
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            detail: Some(serde_json::Value::String(err.to_string())),
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Upstream {
            status: 0,
            detail: Some(serde_json::Value::String(err.to_string())),
        }
    }
}

/// A column lookup failure, kept distinct from [`ProxyError`] so that
/// callers choosing `ignore_missing` semantics can decide whether to
/// propagate it.
#[derive(Debug, Clone)]
pub struct LookupError {
    pub field: String,
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column `{}` not found", self.field)
    }
}

impl std::error::Error for LookupError {}

impl From<LookupError> for ProxyError {
    fn from(err: LookupError) -> Self {
        ProxyError::InvalidQuery(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_display_includes_detail_when_present() {
        let err = ProxyError::Upstream {
            status: 503,
            detail: Some(serde_json::json!({"reason": "down"})),
        };
        assert_eq!(err.to_string(), "upstream failure (503): {\"reason\":\"down\"}");
    }

    #[test]
    fn upstream_display_omits_suffix_without_detail() {
        let err = ProxyError::Upstream { status: 404, detail: None };
        assert_eq!(err.to_string(), "upstream failure (404)");
    }

    #[test]
    fn lookup_error_converts_to_invalid_query() {
        let proxy: ProxyError = LookupError { field: "spid".to_string() }.into();
        assert!(matches!(proxy, ProxyError::InvalidQuery(msg) if msg.contains("spid")));
    }
}

//! JSON Output Envelopes
//!
//! Every CLI command and MCP tool call answers with one of two shapes:
//!
//! - Success: `{"ok": true, "route": "...", "data": {...}}`
//! - Error: `{"ok": false, "route": "...", "error": {"code": "...", "message": "..."}}`
//!
//! `route` is the logical route for query commands (`pattern`, `llm`, `agent`,
//! `raw`, `preset`) and the command name otherwise. The error message is the
//! localized user message: no SQL text, no driver output.

use serde::{Deserialize, Serialize};

use crate::error::AskError;
use crate::i18n::Language;

/// Success envelope, generic over the command's data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    pub route: String,

    pub data: T,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(route: impl Into<String>, data: T) -> Self {
        Self { ok: true, route: route.into(), data }
    }
}

/// Error envelope for failed commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    pub route: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(route: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, route: route.into(), error }
    }

    /// Envelope for `err`, message in `lang`
    ///
    /// The internal detail (`Display`) is logged here and never serialized.
    pub fn from_error(route: impl Into<String>, err: &AskError, lang: Language) -> Self {
        let route = route.into();
        tracing::warn!(%route, code = err.error_code(), detail = %err, "request failed");
        Self::new(route, ErrorInfo::new(err.error_code(), err.user_message(lang)))
    }
}

/// Error information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "MANUAL_SQL_REJECTED", "GENERATION_TIMEOUT")
    pub code: String,

    /// Localized, non-technical message
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::RejectReason;
    use insta::assert_snapshot;

    #[test]
    fn test_success_envelope_serialization() {
        let envelope = SuccessEnvelope::new("pattern", serde_json::json!({"sql": "SELECT 1"}));
        assert_snapshot!(
            serde_json::to_string(&envelope).unwrap(),
            @r#"{"ok":true,"route":"pattern","data":{"sql":"SELECT 1"}}"#
        );
    }

    #[test]
    fn test_error_envelope_hides_internal_detail() {
        let err = AskError::execution_failed("relation \"secret_table\" does not exist");
        let envelope = ErrorEnvelope::from_error("raw", &err, Language::En);

        assert_snapshot!(
            serde_json::to_string(&envelope).unwrap(),
            @r#"{"ok":false,"route":"raw","error":{"code":"EXECUTION_FAILED","message":"The query could not be executed against the database."}}"#
        );
    }

    #[test]
    fn test_error_envelope_localized() {
        let err = AskError::ManualSqlRejected(RejectReason::NotReadOnly);
        let envelope = ErrorEnvelope::from_error("raw", &err, Language::Ar);

        assert!(!envelope.ok);
        assert_eq!(envelope.error.code, "MANUAL_SQL_REJECTED");
        assert!(envelope.error.message.starts_with("تم رفض الاستعلام"));
        assert!(!envelope.error.message.contains("SELECT"));
    }

    #[test]
    fn test_success_envelope_ok_always_true() {
        let envelope = SuccessEnvelope::new("presets", serde_json::json!({}));
        assert!(envelope.ok);
    }
}

//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout Askql.
//! All errors are structured and map to specific error codes for JSON output.
//!
//! # Error Categories
//! - `NoPatternMatch`: no cataloged question shape fired (a "try another route" signal)
//! - `GenerationTimeout` / `GenerationFailed`: the generation service did not answer in time or at all
//! - `Extraction`: the completion contained no statement-shaped span
//! - `UnsafeGeneration`: the guard rejected generated SQL (hard stop, never retried)
//! - `ManualSqlRejected`: the guard rejected caller-supplied SQL
//! - `ExecutionFailed`: database-level failure (syntax, missing object, timeout)
//! - `PresetNotFound`: unknown preset name
//! - `InvalidInput` / `ConfigError`: malformed requests and configuration problems
//!
//! `Display` keeps the internal detail for logs. Callers only ever see
//! [`AskError::user_message`], which never contains SQL text or driver output.

use thiserror::Error;

use crate::guard::RejectReason;
use crate::i18n::Language;

/// Main error type for Askql operations
#[derive(Error, Debug)]
pub enum AskError {
    /// No pattern rule matched the question
    #[error("No pattern matched the question")]
    NoPatternMatch,

    /// The generation call exceeded its timeout
    #[error("Generation timed out after {timeout_ms}ms")]
    GenerationTimeout { timeout_ms: u64 },

    /// The generation service failed or returned an empty completion
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// The completion did not contain a SQL statement
    #[error("Could not extract SQL from completion: {0}")]
    Extraction(String),

    /// The guard rejected a generated statement
    #[error("Generated SQL rejected by guard: {0}")]
    UnsafeGeneration(RejectReason),

    /// The guard rejected caller-supplied SQL
    #[error("Manual SQL rejected by guard: {0}")]
    ManualSqlRejected(RejectReason),

    /// Database-level failure
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Preset name is not in the catalog
    #[error("Preset not found: {0}")]
    PresetNotFound(String),

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (file not found, invalid JSON, bad values)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AskError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NoPatternMatch => "NO_PATTERN_MATCH",
            Self::GenerationTimeout { .. } => "GENERATION_TIMEOUT",
            Self::GenerationFailed(_) => "GENERATION_FAILED",
            Self::Extraction(_) => "EXTRACTION_ERROR",
            Self::UnsafeGeneration(_) => "UNSAFE_GENERATION",
            Self::ManualSqlRejected(_) => "MANUAL_SQL_REJECTED",
            Self::ExecutionFailed(_) => "EXECUTION_FAILED",
            Self::PresetNotFound(_) => "PRESET_NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ConfigError(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the agent path may recover from this error by falling back
    ///
    /// `UnsafeGeneration` is excluded: an unsafe draft stops the request.
    #[must_use]
    pub const fn is_generation_error(&self) -> bool {
        matches!(self, Self::GenerationTimeout { .. } | Self::GenerationFailed(_) | Self::Extraction(_))
    }

    /// Localized, non-technical message for the caller
    ///
    /// This message is safe to include in JSON output: no SQL text,
    /// no driver messages, no file paths.
    #[must_use]
    pub fn user_message(&self, lang: Language) -> String {
        match (self, lang) {
            (Self::NoPatternMatch, Language::Ar) => {
                "لم يتطابق السؤال مع أي نمط معروف. جرّب مسار النموذج اللغوي.".to_string()
            }
            (Self::NoPatternMatch, Language::En) => {
                "The question did not match a known pattern. Try the LLM route.".to_string()
            }
            (Self::GenerationTimeout { .. }, Language::Ar) => {
                "انتهت مهلة توليد الاستعلام. حاول مرة أخرى.".to_string()
            }
            (Self::GenerationTimeout { .. }, Language::En) => {
                "Generating the query took too long. Please try again.".to_string()
            }
            (Self::GenerationFailed(_) | Self::Extraction(_), Language::Ar) => {
                "تعذّر توليد استعلام صالح لهذا السؤال.".to_string()
            }
            (Self::GenerationFailed(_) | Self::Extraction(_), Language::En) => {
                "A valid query could not be generated for this question.".to_string()
            }
            (Self::UnsafeGeneration(_), Language::Ar) => {
                "تم رفض الاستعلام المولَّد لأنه غير آمن للقراءة فقط.".to_string()
            }
            (Self::UnsafeGeneration(_), Language::En) => {
                "The generated query was rejected because it is not read-only safe.".to_string()
            }
            (Self::ManualSqlRejected(reason), Language::Ar) => {
                format!("تم رفض الاستعلام: {}", reason.describe(Language::Ar))
            }
            (Self::ManualSqlRejected(reason), Language::En) => {
                format!("The query was rejected: {}", reason.describe(Language::En))
            }
            (Self::ExecutionFailed(_), Language::Ar) => {
                "تعذّر تنفيذ الاستعلام على قاعدة البيانات.".to_string()
            }
            (Self::ExecutionFailed(_), Language::En) => {
                "The query could not be executed against the database.".to_string()
            }
            (Self::PresetNotFound(_), Language::Ar) => "الاستعلام المحفوظ غير موجود.".to_string(),
            (Self::PresetNotFound(_), Language::En) => "Preset not found.".to_string(),
            (Self::InvalidInput(_), Language::Ar) => "الطلب غير صالح.".to_string(),
            (Self::InvalidInput(_), Language::En) => "The request is not valid.".to_string(),
            (Self::ConfigError(_), Language::Ar) => "إعدادات الخدمة غير صالحة.".to_string(),
            (Self::ConfigError(_), Language::En) => "The service is misconfigured.".to_string(),
        }
    }

    /// Create a generation failure error
    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self::GenerationFailed(message.into())
    }

    /// Create an extraction error
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction(message.into())
    }

    /// Create an execution failure error
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed(message.into())
    }

    /// Create a preset-not-found error
    pub fn preset_not_found(name: impl Into<String>) -> Self {
        Self::PresetNotFound(name.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

/// Result type alias for Askql operations
pub type Result<T> = std::result::Result<T, AskError>;

//! Unified error taxonomy with stable error codes for the Kiwi runtime.
//!
//! Every Kiwi error carries an [`ErrorCode`] (a machine-readable, stable string
//! tag), a human-readable message, an optional cause chain, and arbitrary
//! key-value context. Use the builder returned by [`KiwiError::new`] to
//! construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Tool store / registry access errors.
    Store,
    /// Executor chain resolution errors.
    Resolve,
    /// Package integrity errors.
    Integrity,
    /// Parent→child chain validation errors.
    Validate,
    /// Config merge / parameter templating errors.
    Template,
    /// Subprocess primitive errors.
    Subprocess,
    /// HTTP primitive errors.
    Http,
    /// Streaming sink errors.
    Sink,
    /// Lockfile subsystem errors.
    Lockfile,
    /// Cooperative cancellation.
    Cancelled,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Store => "store",
            Self::Resolve => "resolve",
            Self::Integrity => "integrity",
            Self::Validate => "validate",
            Self::Template => "template",
            Self::Subprocess => "subprocess",
            Self::Http => "http",
            Self::Sink => "sink",
            Self::Lockfile => "lockfile",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Store --
    /// The requested tool id (or version) does not exist in the registry.
    ToolNotFound,
    /// The registry could not be reached.
    RegistryUnavailable,
    /// A registry document could not be decoded.
    DecodeError,

    // -- Resolve --
    /// A non-primitive tool has no `executor_id`.
    MissingExecutor,
    /// The executor graph loops back on itself.
    CycleDetected,
    /// The executor chain exceeds the depth cap.
    ChainTooDeep,
    /// The chain ended on a tool that is not a primitive.
    ChainNotPrimitive,

    // -- Integrity --
    /// Recomputed integrity differs from the stored integrity.
    IntegrityMismatch,

    // -- Validate --
    /// A child tool failed its parent's schema.
    ValidationFailed,
    /// The parent declares child schemas but none matched the child.
    NoMatchingSchema,

    // -- Template --
    /// A declared required parameter was not supplied.
    MissingRequiredParam,
    /// A parameter was supplied that the manifest does not declare (strict mode).
    UnknownParam,
    /// An `${VAR}` reference had no value and no default.
    UnresolvedEnv,

    // -- Subprocess --
    /// The subprocess could not be spawned.
    SubprocessSpawnFailed,
    /// The subprocess exceeded its wall-clock timeout.
    SubprocessTimeout,

    // -- Http --
    /// The HTTP request failed (network error or non-retryable status).
    HttpError,
    /// An SSE stream disconnected before a clean finish.
    StreamIncomplete,

    // -- Sink --
    /// A streaming sink failed to write or close.
    SinkFailure,

    // -- Lockfile --
    /// A lockfile on disk could not be parsed.
    LockfileCorrupt,
    /// The fresh chain diverges from the pinned chain.
    LockfileMismatch,
    /// Lockfile or index I/O failed.
    LockfileIo,

    // -- Cancelled --
    /// The call was cancelled cooperatively.
    Cancelled,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ToolNotFound | Self::RegistryUnavailable | Self::DecodeError => {
                ErrorCategory::Store
            }

            Self::MissingExecutor
            | Self::CycleDetected
            | Self::ChainTooDeep
            | Self::ChainNotPrimitive => ErrorCategory::Resolve,

            Self::IntegrityMismatch => ErrorCategory::Integrity,

            Self::ValidationFailed | Self::NoMatchingSchema => ErrorCategory::Validate,

            Self::MissingRequiredParam | Self::UnknownParam | Self::UnresolvedEnv => {
                ErrorCategory::Template
            }

            Self::SubprocessSpawnFailed | Self::SubprocessTimeout => ErrorCategory::Subprocess,

            Self::HttpError | Self::StreamIncomplete => ErrorCategory::Http,

            Self::SinkFailure => ErrorCategory::Sink,

            Self::LockfileCorrupt | Self::LockfileMismatch | Self::LockfileIo => {
                ErrorCategory::Lockfile
            }

            Self::Cancelled => ErrorCategory::Cancelled,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"INTEGRITY_MISMATCH"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
            Self::DecodeError => "DECODE_ERROR",
            Self::MissingExecutor => "MISSING_EXECUTOR",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::ChainTooDeep => "CHAIN_TOO_DEEP",
            Self::ChainNotPrimitive => "CHAIN_NOT_PRIMITIVE",
            Self::IntegrityMismatch => "INTEGRITY_MISMATCH",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NoMatchingSchema => "NO_MATCHING_SCHEMA",
            Self::MissingRequiredParam => "MISSING_REQUIRED_PARAM",
            Self::UnknownParam => "UNKNOWN_PARAM",
            Self::UnresolvedEnv => "UNRESOLVED_ENV",
            Self::SubprocessSpawnFailed => "SUBPROCESS_SPAWN_FAILED",
            Self::SubprocessTimeout => "SUBPROCESS_TIMEOUT",
            Self::HttpError => "HTTP_ERROR",
            Self::StreamIncomplete => "STREAM_INCOMPLETE",
            Self::SinkFailure => "SINK_FAILURE",
            Self::LockfileCorrupt => "LOCKFILE_CORRUPT",
            Self::LockfileMismatch => "LOCKFILE_MISMATCH",
            Self::LockfileIo => "LOCKFILE_IO",
            Self::Cancelled => "CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// KiwiError
// ---------------------------------------------------------------------------

/// Unified Kiwi error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context. The
/// executor facade uses the context map to report the stage, tool id, and
/// chain index where a failure occurred.
///
/// # Builder usage
///
/// ```
/// use kiwi_error::{ErrorCode, KiwiError};
///
/// let err = KiwiError::new(ErrorCode::IntegrityMismatch, "integrity mismatch")
///     .with_context("tool_id", "weather")
///     .with_context("chain_index", 0);
/// ```
pub struct KiwiError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl KiwiError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for KiwiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("KiwiError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for KiwiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for KiwiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`KiwiError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KiwiErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&KiwiError> for KiwiErrorDto {
    fn from(err: &KiwiError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<KiwiErrorDto> for KiwiError {
    fn from(dto: KiwiErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    /// All error codes for exhaustive iteration in tests.
    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::ToolNotFound,
        ErrorCode::RegistryUnavailable,
        ErrorCode::DecodeError,
        ErrorCode::MissingExecutor,
        ErrorCode::CycleDetected,
        ErrorCode::ChainTooDeep,
        ErrorCode::ChainNotPrimitive,
        ErrorCode::IntegrityMismatch,
        ErrorCode::ValidationFailed,
        ErrorCode::NoMatchingSchema,
        ErrorCode::MissingRequiredParam,
        ErrorCode::UnknownParam,
        ErrorCode::UnresolvedEnv,
        ErrorCode::SubprocessSpawnFailed,
        ErrorCode::SubprocessTimeout,
        ErrorCode::HttpError,
        ErrorCode::StreamIncomplete,
        ErrorCode::SinkFailure,
        ErrorCode::LockfileCorrupt,
        ErrorCode::LockfileMismatch,
        ErrorCode::LockfileIo,
        ErrorCode::Cancelled,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = KiwiError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = KiwiError::new(ErrorCode::ToolNotFound, "no such tool");
        assert_eq!(err.to_string(), "[TOOL_NOT_FOUND] no such tool");
    }

    #[test]
    fn display_with_context() {
        let err = KiwiError::new(ErrorCode::SubprocessTimeout, "timed out")
            .with_context("timeout_ms", 5000);
        let s = err.to_string();
        assert!(s.starts_with("[SUBPROCESS_TIMEOUT] timed out"));
        assert!(s.contains("timeout_ms"));
        assert!(s.contains("5000"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = KiwiError::new(ErrorCode::LockfileIo, "index write failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn store_codes_categorised() {
        assert_eq!(ErrorCode::ToolNotFound.category(), ErrorCategory::Store);
        assert_eq!(
            ErrorCode::RegistryUnavailable.category(),
            ErrorCategory::Store
        );
        assert_eq!(ErrorCode::DecodeError.category(), ErrorCategory::Store);
    }

    #[test]
    fn resolve_codes_categorised() {
        assert_eq!(
            ErrorCode::MissingExecutor.category(),
            ErrorCategory::Resolve
        );
        assert_eq!(ErrorCode::CycleDetected.category(), ErrorCategory::Resolve);
        assert_eq!(ErrorCode::ChainTooDeep.category(), ErrorCategory::Resolve);
        assert_eq!(
            ErrorCode::ChainNotPrimitive.category(),
            ErrorCategory::Resolve
        );
    }

    #[test]
    fn execution_codes_categorised() {
        assert_eq!(
            ErrorCode::SubprocessSpawnFailed.category(),
            ErrorCategory::Subprocess
        );
        assert_eq!(ErrorCode::HttpError.category(), ErrorCategory::Http);
        assert_eq!(ErrorCode::StreamIncomplete.category(), ErrorCategory::Http);
        assert_eq!(ErrorCode::SinkFailure.category(), ErrorCategory::Sink);
    }

    #[test]
    fn lockfile_codes_categorised() {
        assert_eq!(
            ErrorCode::LockfileCorrupt.category(),
            ErrorCategory::Lockfile
        );
        assert_eq!(
            ErrorCode::LockfileMismatch.category(),
            ErrorCategory::Lockfile
        );
        assert_eq!(ErrorCode::LockfileIo.category(), ErrorCategory::Lockfile);
    }

    #[test]
    fn builder_with_context_multiple_keys() {
        let err = KiwiError::new(ErrorCode::IntegrityMismatch, "mismatch")
            .with_context("tool_id", "weather")
            .with_context("chain_index", 2)
            .with_context("expected", "abc");
        assert_eq!(err.context.len(), 3);
        assert_eq!(err.context["tool_id"], serde_json::json!("weather"));
        assert_eq!(err.context["chain_index"], serde_json::json!(2));
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::NoMatchingSchema;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""NO_MATCHING_SCHEMA""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn error_category_serde_roundtrip() {
        let cat = ErrorCategory::Lockfile;
        let json = serde_json::to_string(&cat).unwrap();
        assert_eq!(json, r#""lockfile""#);
        let back: ErrorCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cat);
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = KiwiError::new(ErrorCode::SinkFailure, "sink died").with_source(src);
        let dto: KiwiErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
        let json = serde_json::to_string(&dto).unwrap();
        let back: KiwiErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = KiwiError::new(ErrorCode::LockfileIo, "load").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(seen.insert(s), "duplicate as_str value: {s}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_serialize_to_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let expected = format!(r#""{}""#, code.as_str());
            assert_eq!(json, expected, "mismatch for {code:?}");
        }
    }

    #[test]
    fn error_code_count() {
        // Ensure we don't silently drop a variant from ALL_CODES.
        assert_eq!(ALL_CODES.len(), 23);
    }
}

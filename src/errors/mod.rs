//! Error types for translation request governance.
//!
//! Every failure that leaves this crate is a [`QwenError`]: a closed
//! [`ErrorKind`] plus an immutable context bag, a timestamp and, for wrapped
//! failures, the original source error. The kind fixes the stable `code`,
//! the `category`, the `severity` and whether the failure is retryable or
//! recoverable.

pub mod classify;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for governance operations.
pub type QwenResult<T> = Result<T, QwenError>;

/// Arbitrary failure accepted by classification.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Opaque key/value bag supplied by callers.
pub type ErrorContext = BTreeMap<String, Value>;

/// Broad family an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Provider calls and translation batches.
    Translation,
    /// Persistent storage.
    Storage,
    /// Caller input validation.
    Validation,
    /// Admission control.
    RateLimit,
    /// Translation cache.
    Cache,
    /// Extension messaging.
    Messaging,
    /// PDF loading and viewing.
    Pdf,
    /// Unclassified failures.
    General,
}

impl ErrorCategory {
    /// Returns the stable string form, also used as a recovery strategy key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Translation => "translation",
            Self::Storage => "storage",
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::Cache => "cache",
            Self::Messaging => "messaging",
            Self::Pdf => "pdf",
            Self::General => "general",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly an error should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected, self-healing conditions.
    Low,
    /// Degraded but functional.
    Medium,
    /// Needs attention.
    High,
}

/// Why a request was refused by admission control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitReason {
    /// The provider's budget is exhausted for now.
    Throttled {
        /// Suggested wait before trying again.
        retry_after: Option<Duration>,
    },
    /// The cost alone exceeds the provider's total unit budget.
    CostExceedsLimit {
        /// Requested units.
        units: u64,
        /// Configured unit limit.
        limit: u64,
    },
    /// The request waited in the queue past the queue timeout.
    QueueTimeout {
        /// Time spent queued.
        waited: Duration,
    },
    /// The queue was cleared or the controller shut down.
    Cancelled,
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttled { retry_after: Some(wait) } => {
                write!(f, "retry after {}ms", wait.as_millis())
            }
            Self::Throttled { retry_after: None } => f.write_str("request throttled"),
            Self::CostExceedsLimit { units, limit } => {
                write!(f, "{units} units requested but the limit is {limit}")
            }
            Self::QueueTimeout { waited } => {
                write!(f, "timed out after {}ms in queue", waited.as_millis())
            }
            Self::Cancelled => f.write_str("request cancelled"),
        }
    }
}

/// Every failure condition known to the governance layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    /// An operation did not finish before its deadline.
    #[error("Operation '{operation}' timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Name of the operation.
        operation: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// A translation provider returned a failure.
    #[error("Provider '{provider}' failed: {message}")]
    ProviderFailure {
        /// Provider id.
        provider: String,
        /// Failure description.
        message: String,
        /// HTTP-like status, when the provider reported one.
        status: Option<u16>,
    },

    /// A translation batch was larger than allowed.
    #[error("Batch size {size} exceeds maximum of {max}")]
    BatchSizeExceeded {
        /// Submitted batch size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A storage operation failed.
    #[error("Storage operation '{operation}' failed: {message}")]
    Storage {
        /// Storage operation.
        operation: String,
        /// Failure description.
        message: String,
    },

    /// The storage quota is exhausted.
    #[error("Storage quota exceeded: {message}")]
    QuotaExceeded {
        /// Failure description.
        message: String,
    },

    /// Caller input failed validation.
    #[error("Invalid {field}: {message}")]
    Validation {
        /// Offending field.
        field: String,
        /// Failure description.
        message: String,
    },

    /// Admission control refused the request.
    #[error("Rate limit exceeded for provider '{provider}': {reason}")]
    RateLimitExceeded {
        /// Provider id.
        provider: String,
        /// Refusal reason.
        reason: RateLimitReason,
    },

    /// The provider is not configured.
    #[error("Provider '{provider}' is not configured")]
    InvalidProvider {
        /// Provider id.
        provider: String,
    },

    /// Configuration values are invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Failure description.
        message: String,
    },

    /// The translation cache is at capacity.
    #[error("Cache full ({entries}/{max_entries} entries)")]
    CacheFull {
        /// Current entry count.
        entries: usize,
        /// Capacity.
        max_entries: usize,
    },

    /// Encoding or decoding failed.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Failure description.
        message: String,
    },

    /// A message to another extension context got no reply in time.
    #[error("Message '{message_type}' timed out after {}ms", .timeout.as_millis())]
    MessageTimeout {
        /// Message type.
        message_type: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// The extension context was reloaded or torn down.
    #[error("Extension context invalidated")]
    ContextInvalidated,

    /// The target tab no longer exists.
    #[error("Tab {tab_id} not found")]
    TabNotFound {
        /// Tab id.
        tab_id: i64,
    },

    /// A PDF document could not be loaded.
    #[error("Failed to load PDF '{url}': {message}")]
    PdfLoad {
        /// Document location.
        url: String,
        /// Failure description.
        message: String,
    },

    /// The PDF viewer failed.
    #[error("PDF viewer error: {message}")]
    PdfViewer {
        /// Failure description.
        message: String,
    },

    /// The shared admission queue is full.
    #[error("Request queue full ({max_size} pending) for provider '{provider}'")]
    QueueFull {
        /// Provider id.
        provider: String,
        /// Configured maximum queue size.
        max_size: usize,
    },

    /// The requested cost is not a finite non-negative number.
    #[error("Invalid unit count: {value}")]
    InvalidUnits {
        /// Offending value.
        value: String,
    },

    /// No failure information was available.
    #[error("Unknown error")]
    Unknown,

    /// A failure that matched no known kind.
    #[error("{message}")]
    Wrapped {
        /// Original failure message.
        message: String,
    },
}

impl ErrorKind {
    /// Stable machine-readable identifier.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "TIMEOUT",
            Self::ProviderFailure { .. } => "PROVIDER_ERROR",
            Self::BatchSizeExceeded { .. } => "BATCH_SIZE_EXCEEDED",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::InvalidProvider { .. } => "INVALID_PROVIDER",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::CacheFull { .. } => "CACHE_FULL",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::MessageTimeout { .. } => "MESSAGE_TIMEOUT",
            Self::ContextInvalidated => "CONTEXT_INVALIDATED",
            Self::TabNotFound { .. } => "TAB_NOT_FOUND",
            Self::PdfLoad { .. } => "PDF_LOAD_ERROR",
            Self::PdfViewer { .. } => "PDF_VIEWER_ERROR",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::InvalidUnits { .. } => "INVALID_UNITS",
            Self::Unknown => "UNKNOWN_ERROR",
            Self::Wrapped { .. } => "WRAPPED_ERROR",
        }
    }

    /// Family of this kind.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. } | Self::ProviderFailure { .. } | Self::BatchSizeExceeded { .. } => {
                ErrorCategory::Translation
            }
            Self::Storage { .. } | Self::QuotaExceeded { .. } => ErrorCategory::Storage,
            Self::Validation { .. } | Self::InvalidUnits { .. } => ErrorCategory::Validation,
            Self::RateLimitExceeded { .. }
            | Self::InvalidProvider { .. }
            | Self::Configuration { .. }
            | Self::QueueFull { .. } => ErrorCategory::RateLimit,
            Self::CacheFull { .. } | Self::Serialization { .. } => ErrorCategory::Cache,
            Self::MessageTimeout { .. } | Self::ContextInvalidated | Self::TabNotFound { .. } => {
                ErrorCategory::Messaging
            }
            Self::PdfLoad { .. } | Self::PdfViewer { .. } => ErrorCategory::Pdf,
            Self::Unknown | Self::Wrapped { .. } => ErrorCategory::General,
        }
    }

    /// Returns true if repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimitExceeded { reason, .. } => matches!(
                reason,
                RateLimitReason::Throttled { .. } | RateLimitReason::QueueTimeout { .. }
            ),
            Self::ProviderFailure { status, .. } => !matches!(status, Some(400..=499)),
            Self::Timeout { .. }
            | Self::Storage { .. }
            | Self::MessageTimeout { .. }
            | Self::PdfLoad { .. } => true,
            _ => false,
        }
    }

    /// Returns true if a recovery strategy may resolve the failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ProviderFailure { .. }
                | Self::BatchSizeExceeded { .. }
                | Self::Storage { .. }
                | Self::QuotaExceeded { .. }
                | Self::RateLimitExceeded { .. }
                | Self::CacheFull { .. }
                | Self::MessageTimeout { .. }
        )
    }

    /// Reporting severity.
    pub fn severity(&self) -> Severity {
        match self {
            Self::CacheFull { .. } | Self::TabNotFound { .. } => Severity::Low,
            Self::ProviderFailure { .. }
            | Self::QuotaExceeded { .. }
            | Self::InvalidProvider { .. }
            | Self::Configuration { .. }
            | Self::ContextInvalidated
            | Self::PdfViewer { .. } => Severity::High,
            _ => Severity::Medium,
        }
    }
}

/// A classified failure.
///
/// Immutable once built: the `with_*` methods consume the value and are meant
/// for construction only.
#[derive(Debug, Clone)]
pub struct QwenError {
    kind: ErrorKind,
    context: ErrorContext,
    timestamp: DateTime<Utc>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl QwenError {
    /// Creates an error of the given kind with an empty context.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: ErrorContext::new(),
            timestamp: Utc::now(),
            source: None,
        }
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Merges a context bag; existing keys are kept.
    #[must_use]
    pub fn with_context_map(mut self, context: &ErrorContext) -> Self {
        for (key, value) in context {
            self.context
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Attaches the underlying failure.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(Arc::from(source.into()));
        self
    }

    /// Timeout of a named operation.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::new(ErrorKind::Timeout {
            operation: operation.into(),
            timeout,
        })
    }

    /// Provider failure.
    pub fn provider_failure(
        provider: impl Into<String>,
        message: impl Into<String>,
        status: Option<u16>,
    ) -> Self {
        Self::new(ErrorKind::ProviderFailure {
            provider: provider.into(),
            message: message.into(),
            status,
        })
    }

    /// Rate limit refusal.
    pub fn rate_limited(provider: impl Into<String>, reason: RateLimitReason) -> Self {
        Self::new(ErrorKind::RateLimitExceeded {
            provider: provider.into(),
            reason,
        })
    }

    /// Unknown provider.
    pub fn invalid_provider(provider: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidProvider {
            provider: provider.into(),
        })
    }

    /// Invalid configuration.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration {
            message: message.into(),
        })
    }

    /// Returns the kind.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Returns the stable code.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Returns the category.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the severity.
    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// Returns true if the failure may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns true if a recovery strategy may resolve the failure.
    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    /// Returns the context bag.
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Returns when the error was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the formatted message.
    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    /// Returns the suggested wait for throttled requests.
    pub fn retry_after(&self) -> Option<Duration> {
        match &self.kind {
            ErrorKind::RateLimitExceeded {
                reason: RateLimitReason::Throttled { retry_after },
                ..
            } => *retry_after,
            _ => None,
        }
    }

    /// Sentence suitable for showing to an end user.
    pub fn user_message(&self) -> &'static str {
        match &self.kind {
            ErrorKind::Timeout { .. } => "The translation took too long. Please try again.",
            ErrorKind::ProviderFailure { .. } => {
                "The translation service returned an error. Please try again or switch providers."
            }
            ErrorKind::BatchSizeExceeded { .. } => "Too much text was sent at once.",
            ErrorKind::Storage { .. } => "Settings could not be saved.",
            ErrorKind::QuotaExceeded { .. } => "Storage is full. Old translations will be cleared.",
            ErrorKind::Validation { .. } | ErrorKind::InvalidUnits { .. } => {
                "The request was invalid."
            }
            ErrorKind::RateLimitExceeded { .. } | ErrorKind::QueueFull { .. } => {
                "Too many translation requests. Please wait a moment."
            }
            ErrorKind::InvalidProvider { .. } => "The selected translation provider is not set up.",
            ErrorKind::Configuration { .. } => "The translator configuration is invalid.",
            ErrorKind::CacheFull { .. } => "The translation cache is full.",
            ErrorKind::Serialization { .. } => "Data could not be processed.",
            ErrorKind::MessageTimeout { .. } => "The page did not respond in time.",
            ErrorKind::ContextInvalidated => "The extension was updated. Please reload the page.",
            ErrorKind::TabNotFound { .. } => "The tab was closed.",
            ErrorKind::PdfLoad { .. } => "The PDF could not be loaded.",
            ErrorKind::PdfViewer { .. } => "The PDF viewer failed.",
            ErrorKind::Unknown | ErrorKind::Wrapped { .. } => "An unexpected error occurred.",
        }
    }

    /// Classifies an arbitrary failure. See [`classify::wrap`].
    pub fn wrap(failure: impl Into<BoxError>, context: &ErrorContext) -> Self {
        classify::wrap(failure, context)
    }

    /// JSON form for messaging to other extension contexts.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "name": "QwenError",
            "message": self.message(),
            "code": self.code(),
            "category": self.category(),
            "severity": self.severity(),
            "retryable": self.is_retryable(),
            "recoverable": self.is_recoverable(),
            "context": self.context,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

impl fmt::Display for QwenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.kind)
    }
}

impl std::error::Error for QwenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for QwenError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<serde_json::Error> for QwenError {
    fn from(err: serde_json::Error) -> Self {
        let message = err.to_string();
        Self::new(ErrorKind::Serialization { message }).with_source(err)
    }
}

impl Serialize for QwenError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_metadata() {
        let err = QwenError::timeout("translate", Duration::from_millis(5000));
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(err.category(), ErrorCategory::Translation);
        assert!(err.is_retryable());
        assert!(err.is_recoverable());
        assert_eq!(err.severity(), Severity::Medium);
        assert_eq!(err.message(), "Operation 'translate' timed out after 5000ms");
    }

    #[test]
    fn test_rate_limit_retryability_depends_on_reason() {
        let throttled = QwenError::rate_limited(
            "qwen",
            RateLimitReason::Throttled {
                retry_after: Some(Duration::from_millis(250)),
            },
        );
        assert!(throttled.is_retryable());
        assert_eq!(throttled.retry_after(), Some(Duration::from_millis(250)));

        let oversized = QwenError::rate_limited(
            "qwen",
            RateLimitReason::CostExceedsLimit {
                units: 500,
                limit: 100,
            },
        );
        assert!(!oversized.is_retryable());
        assert_eq!(oversized.category(), ErrorCategory::RateLimit);
    }

    #[test]
    fn test_provider_client_errors_not_retryable() {
        assert!(QwenError::provider_failure("deepl", "bad gateway", Some(502)).is_retryable());
        assert!(!QwenError::provider_failure("deepl", "bad request", Some(400)).is_retryable());
        assert!(QwenError::provider_failure("deepl", "reset", None).is_retryable());
    }

    #[test]
    fn test_display_includes_code() {
        let err = QwenError::invalid_provider("ghost");
        assert_eq!(
            err.to_string(),
            "[INVALID_PROVIDER] Provider 'ghost' is not configured"
        );
    }

    #[test]
    fn test_context_and_json() {
        let err = QwenError::new(ErrorKind::CacheFull {
            entries: 10,
            max_entries: 10,
        })
        .with_context("cache", "memory");

        let json = err.to_json();
        assert_eq!(json["code"], "CACHE_FULL");
        assert_eq!(json["category"], "cache");
        assert_eq!(json["severity"], "low");
        assert_eq!(json["recoverable"], true);
        assert_eq!(json["context"]["cache"], "memory");
    }

    #[test]
    fn test_context_map_keeps_existing_keys() {
        let mut extra = ErrorContext::new();
        extra.insert("provider".into(), Value::from("other"));
        extra.insert("attempt".into(), Value::from(2));

        let err = QwenError::configuration("bad")
            .with_context("provider", "qwen")
            .with_context_map(&extra);

        assert_eq!(err.context()["provider"], "qwen");
        assert_eq!(err.context()["attempt"], 2);
    }

    #[test]
    fn test_source_is_exposed() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = QwenError::new(ErrorKind::Storage {
            operation: "set".into(),
            message: "disk gone".into(),
        })
        .with_source(io);

        assert_eq!(err.source().map(ToString::to_string), Some("disk gone".into()));
    }
}

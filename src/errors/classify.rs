//! Mapping of arbitrary failures onto the error taxonomy.
//!
//! Typed failures pass through untouched. Anything else is matched against
//! its message text, which is a last resort for layers that cannot raise
//! [`QwenError`] themselves.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

use super::{BoxError, ErrorContext, ErrorKind, QwenError, RateLimitReason};

/// Deadline assumed when a timeout message does not name one.
pub const ASSUMED_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy)]
enum MessageClass {
    Timeout,
    RateLimit,
    Quota,
    ContextInvalidated,
}

fn message_patterns() -> &'static [(Regex, MessageClass)] {
    static PATTERNS: OnceLock<Vec<(Regex, MessageClass)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)timeout|timed out", MessageClass::Timeout),
            (r"(?i)rate limit|\b429\b", MessageClass::RateLimit),
            (r"(?i)quota|storage", MessageClass::Quota),
            (r"(?i)context invalidated", MessageClass::ContextInvalidated),
        ]
        .into_iter()
        .filter_map(|(pattern, class)| Regex::new(pattern).ok().map(|re| (re, class)))
        .collect()
    })
}

/// Guesses a kind from a free-text failure message.
///
/// Patterns are tried in order; the first match wins.
pub fn classify_message(message: &str) -> Option<ErrorKind> {
    let class = message_patterns()
        .iter()
        .find(|(re, _)| re.is_match(message))
        .map(|(_, class)| *class)?;

    Some(match class {
        MessageClass::Timeout => ErrorKind::Timeout {
            operation: "unknown".to_string(),
            timeout: ASSUMED_TIMEOUT,
        },
        MessageClass::RateLimit => ErrorKind::RateLimitExceeded {
            provider: "unknown".to_string(),
            reason: RateLimitReason::Throttled { retry_after: None },
        },
        MessageClass::Quota => ErrorKind::QuotaExceeded {
            message: message.to_string(),
        },
        MessageClass::ContextInvalidated => ErrorKind::ContextInvalidated,
    })
}

/// Classifies a failure.
///
/// A [`QwenError`] is returned unchanged and `context` is ignored. Other
/// failures are classified by message; unmatched ones become
/// `WRAPPED_ERROR`. The original failure is kept as the source and its
/// message under the `original_error` context key.
pub fn wrap(failure: impl Into<BoxError>, context: &ErrorContext) -> QwenError {
    let failure: BoxError = failure.into();
    let failure = match failure.downcast::<QwenError>() {
        Ok(typed) => return *typed,
        Err(other) => other,
    };

    let message = failure.to_string();
    let kind = classify_message(&message).unwrap_or_else(|| ErrorKind::Wrapped {
        message: message.clone(),
    });

    QwenError::new(kind)
        .with_context("original_error", message)
        .with_context_map(context)
        .with_source(failure)
}

/// Classifies a possibly absent failure; `None` becomes `UNKNOWN_ERROR`.
pub fn wrap_optional(failure: Option<BoxError>, context: &ErrorContext) -> QwenError {
    match failure {
        Some(failure) => wrap(failure, context),
        None => QwenError::new(ErrorKind::Unknown).with_context_map(context),
    }
}

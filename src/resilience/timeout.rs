//! Deadlines for single operations.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::manager::{ErrorManager, RecoveryOutcome};
use crate::errors::{BoxError, ErrorContext, ErrorKind, QwenError, QwenResult};

/// What a deadline guards, which decides the error raised on expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutKind {
    /// A named operation, raising `TIMEOUT`.
    Operation(String),
    /// A message to another context, raising `MESSAGE_TIMEOUT`.
    Message(String),
}

impl TimeoutKind {
    /// An operation deadline.
    pub fn operation(name: impl Into<String>) -> Self {
        Self::Operation(name.into())
    }

    /// A message deadline.
    pub fn message(message_type: impl Into<String>) -> Self {
        Self::Message(message_type.into())
    }

    fn into_error(self, timeout: Duration) -> QwenError {
        match self {
            Self::Operation(operation) => QwenError::timeout(operation, timeout),
            Self::Message(message_type) => QwenError::new(ErrorKind::MessageTimeout {
                message_type,
                timeout,
            }),
        }
    }
}

impl Default for TimeoutKind {
    fn default() -> Self {
        Self::Operation("unknown".to_string())
    }
}

impl ErrorManager {
    /// Races `operation` against `timeout`.
    ///
    /// Expiry yields the timeout error for `kind` and drops the operation.
    /// A failure goes through [`ErrorManager::handle_error`]; if a strategy
    /// recovers, its value is decoded as `T`.
    pub async fn with_timeout<Fut, T, E>(
        &self,
        operation: Fut,
        timeout: Duration,
        kind: TimeoutKind,
    ) -> QwenResult<T>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        T: DeserializeOwned,
    {
        match tokio::time::timeout(timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => {
                let mut context = ErrorContext::new();
                context.insert(
                    "timeout_ms".to_string(),
                    Value::from(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
                );
                match self.handle_error(failure, context).await {
                    RecoveryOutcome::Recovered { result } => {
                        Ok(serde_json::from_value(result)?)
                    }
                    RecoveryOutcome::Unrecovered { error } => Err(error),
                }
            }
            Err(_) => {
                let error = kind.into_error(timeout);
                warn!(error = %error, "Deadline exceeded");
                Err(error)
            }
        }
    }
}

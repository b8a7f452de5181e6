//! Observability for the governance layer.
//!
//! All components emit `tracing` events directly. The [`Logger`] trait is the
//! injectable sink the error manager reports classified errors through.

mod logging;

pub use logging::{
    init_tracing, LogFormat, LogLevel, Logger, LoggingConfig, NoopLogger, TracingLogger,
};

#[cfg(test)]
pub(crate) use logging::MockLogger;

use crate::errors::Severity;

/// Level an error of the given severity is reported at.
pub fn level_for(severity: Severity) -> LogLevel {
    match severity {
        Severity::Low => LogLevel::Debug,
        Severity::Medium => LogLevel::Warn,
        Severity::High => LogLevel::Error,
    }
}

//! Logging sinks and subscriber setup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::ErrorContext;

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Leveled sink with structured context.
///
/// The error manager reports through this trait so hosts can route messages
/// to their own console or telemetry.
#[cfg_attr(test, mockall::automock)]
pub trait Logger: Send + Sync {
    /// Logs a message at the specified level.
    fn log(&self, level: LogLevel, message: &str, context: &ErrorContext);
}

/// Forwards to `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, context: &ErrorContext) {
        let context = serde_json::to_string(context).unwrap_or_default();

        match level {
            LogLevel::Trace => tracing::trace!(context = %context, "{message}"),
            LogLevel::Debug => tracing::debug!(context = %context, "{message}"),
            LogLevel::Info => tracing::info!(context = %context, "{message}"),
            LogLevel::Warn => tracing::warn!(context = %context, "{message}"),
            LogLevel::Error => tracing::error!(context = %context, "{message}"),
        }
    }
}

/// Discards all messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: LogLevel, _message: &str, _context: &ErrorContext) {}
}

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Structured JSON.
    Json,
}

/// Subscriber configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is not set.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns false if a
/// global subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    result.is_ok()
}

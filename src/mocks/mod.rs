//! Mock implementations for testing.
//!
//! A log sink that records what it receives and an operation that fails a
//! scripted number of times before succeeding.

use std::future::{ready, Ready};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::errors::{ErrorContext, QwenError};
use crate::observability::{LogLevel, Logger};

/// A recorded log call.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Level.
    pub level: LogLevel,
    /// Message.
    pub message: String,
    /// Structured fields.
    pub context: ErrorContext,
}

/// Logger that keeps every entry in memory.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLogger {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the levels of the recorded entries.
    pub fn levels(&self) -> Vec<LogLevel> {
        self.entries().into_iter().map(|entry| entry.level).collect()
    }

    /// Discards recorded entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: LogLevel, message: &str, context: &ErrorContext) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry {
                level,
                message: message.to_string(),
                context: context.clone(),
            });
    }
}

/// Operation that fails `failures` times, then returns `"ok"`.
#[derive(Debug)]
pub struct FlakyOperation {
    failures: u32,
    error: QwenError,
    calls: AtomicU32,
}

impl FlakyOperation {
    /// Creates an operation that fails `failures` times with `error`.
    pub fn new(failures: u32, error: QwenError) -> Self {
        Self {
            failures,
            error,
            calls: AtomicU32::new(0),
        }
    }

    /// Runs one attempt.
    pub fn call(&self, _attempt: u32) -> Ready<Result<&'static str, QwenError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            ready(Err(self.error.clone()))
        } else {
            ready(Ok("ok"))
        }
    }

    /// Number of attempts made so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

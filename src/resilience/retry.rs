//! Retry with exponential backoff.

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::manager::ErrorManager;
use crate::config::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES};
use crate::errors::{BoxError, ErrorContext, QwenError, QwenResult};

/// Largest fraction of the delay added as jitter.
const JITTER_RATIO: f64 = 0.1;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry attempts after the first call.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for any single delay, before jitter.
    pub max_delay: Duration,
    /// Whether to add up to 10% random jitter.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets whether to use jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Creates a configuration with no retries.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// `min(base * 2^(retry - 1), max)`, plus up to 10% jitter when enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_secs_f64() * 1000.0 * 2f64.powi(exponent);
        let delay_ms = base_ms.min(self.max_delay.as_secs_f64() * 1000.0);

        let delay_ms = if self.jitter {
            delay_ms + rand::random::<f64>() * JITTER_RATIO * delay_ms
        } else {
            delay_ms
        };

        Duration::from_secs_f64(delay_ms / 1000.0)
    }
}

/// Decides whether a failure should be retried.
pub type RetryCondition = Box<dyn Fn(&QwenError) -> bool + Send + Sync>;

/// Observes each scheduled retry: error, retry number and delay.
pub type RetryObserver = Box<dyn Fn(&QwenError, u32, Duration) + Send + Sync>;

/// Per-call overrides for [`ErrorManager::with_retry`].
#[derive(Default)]
pub struct RetryOptions {
    max_retries: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<bool>,
    retry_condition: Option<RetryCondition>,
    on_retry: Option<RetryObserver>,
    context: ErrorContext,
}

impl RetryOptions {
    /// Creates options that inherit everything from the manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Overrides the base delay.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Overrides the delay ceiling.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Overrides jitter.
    #[must_use]
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Replaces the default predicate (`error.is_retryable()`).
    #[must_use]
    pub fn retry_if(mut self, condition: impl Fn(&QwenError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_condition = Some(Box::new(condition));
        self
    }

    /// Registers an observer called before each retry delay.
    #[must_use]
    pub fn on_retry(
        mut self,
        observer: impl Fn(&QwenError, u32, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Box::new(observer));
        self
    }

    /// Adds a context entry used for classification and reporting.
    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Uses `retries` unless the caller already set a budget.
    pub(crate) fn default_max_retries(mut self, retries: u32) -> Self {
        self.max_retries.get_or_insert(retries);
        self
    }

    fn resolve(&self, defaults: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }

    fn should_retry(&self, error: &QwenError) -> bool {
        match &self.retry_condition {
            Some(condition) => condition(error),
            None => error.is_retryable(),
        }
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retry_condition", &self.retry_condition.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("context", &self.context)
            .finish()
    }
}

impl ErrorManager {
    /// Runs `operation` until it succeeds or the retry budget is spent.
    ///
    /// The operation receives the 0-based attempt index. A success after
    /// failures returns the count of each failed code to the value it had
    /// before that code first failed in this call. When retrying
    /// stops, the last error is passed to [`ErrorManager::handle_error`] with
    /// `retries_exhausted` and `attempts` in the context, then returned.
    #[instrument(skip_all)]
    pub async fn with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        options: RetryOptions,
    ) -> QwenResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let config = options.resolve(&self.config().retry);
        let mut attempt: u32 = 0;
        let mut baselines: Vec<(&'static str, u64)> = Vec::new();

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    for (code, count) in baselines {
                        self.restore_error_count(code, count);
                        debug!(code, attempts = attempt + 1, "Recovered after retry");
                    }
                    return Ok(value);
                }
                Err(failure) => {
                    let error = QwenError::wrap(failure, &options.context);
                    let exhausted = attempt >= config.max_retries;

                    if exhausted || !options.should_retry(&error) {
                        let mut context = options.context.clone();
                        context.insert("retries_exhausted".to_string(), Value::Bool(exhausted));
                        context.insert("attempts".to_string(), Value::from(attempt + 1));
                        self.handle_error(error.clone(), context).await;
                        return Err(error);
                    }

                    let retry = attempt + 1;
                    let delay = config.delay_for(retry);
                    if let Some(observer) = &options.on_retry {
                        observer(&error, retry, delay);
                    }
                    info!(
                        retry,
                        max_retries = config.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Retrying after error"
                    );

                    let code = error.code();
                    if !baselines.iter().any(|(seen, _)| *seen == code) {
                        baselines.push((code, self.error_count(code)));
                    }
                    tokio::time::sleep(delay).await;
                    attempt = retry;
                }
            }
        }
    }
}

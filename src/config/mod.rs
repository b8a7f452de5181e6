//! Configuration for the governance layer.
//!
//! Covers retry/backoff defaults, admission queue tuning and the
//! per-provider quota table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::errors::{QwenError, QwenResult};
use crate::resilience::{RetryConfig, ThrottleConfig};

/// Default maximum retry attempts after the first call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default ceiling for backoff delays.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Default number of error history entries kept.
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// How long a request may wait in the admission queue.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(60);

/// Queued requests admitted per drain pass.
pub const DEFAULT_DRAIN_BATCH_SIZE: usize = 10;

/// Upper bound on the pause between drain passes.
pub const DEFAULT_MAX_DRAIN_INTERVAL: Duration = Duration::from_millis(1000);

/// Refills closer together than this are skipped.
pub const DEFAULT_MIN_REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Default shared queue bound per provider configuration.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

/// Default burst multiplier.
pub const DEFAULT_BURST_MULTIPLIER: f64 = 1.0;

/// Default per-provider retry delay.
pub const DEFAULT_PROVIDER_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Limits supplied when configuring a provider.
///
/// Deserializes from the camelCase shape used by the extension settings
/// (`requestLimit`, `unitLimit`, `windowMs`, ...). Optional fields fall back
/// to the crate defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLimits {
    /// Requests allowed per window.
    pub request_limit: u32,
    /// Units allowed per window.
    pub unit_limit: u64,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Shared queue bound enforced for this provider's requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    /// Burst multiplier, reported with usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_multiplier: Option<f64>,
    /// Drain back-off for this provider, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// Retry budget for governed calls to this provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl ProviderLimits {
    /// Creates limits with the required fields.
    pub fn new(request_limit: u32, unit_limit: u64, window: Duration) -> Self {
        Self {
            request_limit,
            unit_limit,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max_queue_size: None,
            burst_multiplier: None,
            retry_delay_ms: None,
            max_retries: None,
        }
    }

    /// Sets the queue bound.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    /// Sets the burst multiplier.
    pub fn burst_multiplier(mut self, multiplier: f64) -> Self {
        self.burst_multiplier = Some(multiplier);
        self
    }

    /// Sets the drain back-off.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the retry budget for governed calls.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Validates and merges with defaults.
    pub fn resolve(&self) -> QwenResult<ProviderConfig> {
        if self.request_limit == 0 {
            return Err(QwenError::configuration("requestLimit must be a positive number"));
        }
        if self.unit_limit == 0 {
            return Err(QwenError::configuration("unitLimit must be a positive number"));
        }
        if self.window_ms == 0 {
            return Err(QwenError::configuration("windowMs must be a positive number"));
        }
        let burst_multiplier = self.burst_multiplier.unwrap_or(DEFAULT_BURST_MULTIPLIER);
        if !burst_multiplier.is_finite() || burst_multiplier <= 0.0 {
            return Err(QwenError::configuration(
                "burstMultiplier must be a positive finite number",
            ));
        }

        Ok(ProviderConfig {
            request_limit: self.request_limit,
            unit_limit: self.unit_limit,
            window: Duration::from_millis(self.window_ms),
            max_queue_size: self.max_queue_size.unwrap_or(DEFAULT_MAX_QUEUE_SIZE),
            burst_multiplier,
            retry_delay: self
                .retry_delay_ms
                .map_or(DEFAULT_PROVIDER_RETRY_DELAY, Duration::from_millis),
            max_retries: self.max_retries,
        })
    }
}

/// Validated configuration of one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    /// Requests allowed per window.
    pub request_limit: u32,
    /// Units allowed per window.
    pub unit_limit: u64,
    /// Window length.
    pub window: Duration,
    /// Shared queue bound.
    pub max_queue_size: usize,
    /// Burst multiplier.
    pub burst_multiplier: f64,
    /// Drain back-off.
    pub retry_delay: Duration,
    /// Retry budget for governed calls; `None` uses the manager's.
    pub max_retries: Option<u32>,
}

/// Provider id to limits, as stored in settings.
pub type ProviderTable = BTreeMap<String, ProviderLimits>;

/// Parses a provider table from JSON.
pub fn parse_provider_table(json: &str) -> QwenResult<ProviderTable> {
    serde_json::from_str(json)
        .map_err(|e| QwenError::configuration(format!("invalid provider table: {e}")))
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    /// Retry and backoff settings.
    pub retry: RetryConfig,
    /// Maximum error history entries.
    pub max_history: usize,
    /// Admission queue tuning.
    pub throttle: ThrottleConfig,
    /// Providers configured at startup.
    pub providers: ProviderTable,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_history: DEFAULT_MAX_HISTORY,
            throttle: ThrottleConfig::default(),
            providers: ProviderTable::new(),
        }
    }
}

impl GovernanceConfig {
    /// Creates a configuration builder.
    pub fn builder() -> GovernanceConfigBuilder {
        GovernanceConfigBuilder::new()
    }

    /// Creates a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `QWEN_GOV_MAX_RETRIES`: retry attempts after the first call
    /// - `QWEN_GOV_BASE_DELAY_MS`: backoff base delay
    /// - `QWEN_GOV_MAX_DELAY_MS`: backoff ceiling
    /// - `QWEN_GOV_MAX_HISTORY`: error history size
    /// - `QWEN_GOV_QUEUE_TIMEOUT_MS`: admission queue timeout
    /// - `QWEN_GOV_PROVIDERS`: JSON provider table
    pub fn from_env() -> QwenResult<Self> {
        let mut builder = GovernanceConfigBuilder::new();

        if let Some(retries) = env_number::<u32>("QWEN_GOV_MAX_RETRIES")? {
            builder = builder.max_retries(retries);
        }
        if let Some(ms) = env_number::<u64>("QWEN_GOV_BASE_DELAY_MS")? {
            builder = builder.base_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = env_number::<u64>("QWEN_GOV_MAX_DELAY_MS")? {
            builder = builder.max_delay(Duration::from_millis(ms));
        }
        if let Some(size) = env_number::<usize>("QWEN_GOV_MAX_HISTORY")? {
            builder = builder.max_history(size);
        }
        if let Some(ms) = env_number::<u64>("QWEN_GOV_QUEUE_TIMEOUT_MS")? {
            builder = builder.queue_timeout(Duration::from_millis(ms));
        }
        if let Ok(json) = std::env::var("QWEN_GOV_PROVIDERS") {
            for (id, limits) in parse_provider_table(&json)? {
                builder = builder.provider(id, limits);
            }
        }

        builder.build()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> QwenResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QwenError::configuration(format!("{name} must be a number, got '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Builder for [`GovernanceConfig`].
#[derive(Debug, Default)]
pub struct GovernanceConfigBuilder {
    config: GovernanceConfig,
}

impl GovernanceConfigBuilder {
    /// Creates a builder seeded with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry budget.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    /// Sets the backoff base delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    /// Sets the backoff ceiling.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    /// Enables or disables backoff jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    /// Sets the error history size.
    pub fn max_history(mut self, size: usize) -> Self {
        self.config.max_history = size;
        self
    }

    /// Sets the admission queue timeout.
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.config.throttle.queue_timeout = timeout;
        self
    }

    /// Sets the drain batch size.
    pub fn drain_batch_size(mut self, size: usize) -> Self {
        self.config.throttle.drain_batch_size = size;
        self
    }

    /// Adds a provider configured at startup.
    pub fn provider(mut self, id: impl Into<String>, limits: ProviderLimits) -> Self {
        self.config.providers.insert(id.into(), limits);
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> QwenResult<GovernanceConfig> {
        let config = self.config;

        if config.retry.base_delay > config.retry.max_delay {
            return Err(QwenError::configuration(
                "base delay must not exceed max delay",
            ));
        }
        if config.max_history == 0 {
            return Err(QwenError::configuration("max history must be positive"));
        }
        if config.throttle.drain_batch_size == 0 {
            return Err(QwenError::configuration("drain batch size must be positive"));
        }
        for (id, limits) in &config.providers {
            limits
                .resolve()
                .map_err(|e| e.with_context("provider", id.as_str()))?;
        }

        Ok(config)
    }
}

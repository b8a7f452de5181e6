//! Recovery strategies.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::debug;

use super::manager::ErrorManager;
use crate::errors::{ErrorContext, ErrorKind, QwenError, QwenResult};

/// Context key listing providers already attempted.
pub const TRIED_PROVIDERS_KEY: &str = "tried_providers";

/// Attempts to turn a failure into a usable result.
///
/// `Ok(Some(value))` recovers with `value`. `Ok(None)` and `Err(_)` leave the
/// error unrecovered.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Attempts recovery.
    async fn recover(&self, error: &QwenError, context: &ErrorContext)
        -> QwenResult<Option<Value>>;
}

/// Strategy backed by an async closure. See [`strategy_fn`].
pub struct FnStrategy<F> {
    f: F,
}

/// Wraps an async closure as a [`RecoveryStrategy`].
pub fn strategy_fn<F, Fut>(f: F) -> FnStrategy<F>
where
    F: Fn(QwenError, ErrorContext) -> Fut + Send + Sync,
    Fut: Future<Output = QwenResult<Option<Value>>> + Send,
{
    FnStrategy { f }
}

#[async_trait]
impl<F, Fut> RecoveryStrategy for FnStrategy<F>
where
    F: Fn(QwenError, ErrorContext) -> Fut + Send + Sync,
    Fut: Future<Output = QwenResult<Option<Value>>> + Send,
{
    async fn recover(
        &self,
        error: &QwenError,
        context: &ErrorContext,
    ) -> QwenResult<Option<Value>> {
        (self.f)(error.clone(), context.clone()).await
    }
}

/// Housekeeping requested by the default strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceSignal {
    /// Evict old cache entries.
    EvictCache,
    /// Drop stale translation history.
    PurgeStaleHistory,
}

impl MaintenanceSignal {
    fn action(self) -> &'static str {
        match self {
            Self::EvictCache => "evict_cache",
            Self::PurgeStaleHistory => "purge_stale_history",
        }
    }
}

fn send_signal(
    signals: &mpsc::UnboundedSender<MaintenanceSignal>,
    signal: MaintenanceSignal,
) -> Option<Value> {
    match signals.send(signal) {
        Ok(()) => Some(json!({ "action": signal.action() })),
        Err(_) => {
            debug!(action = signal.action(), "Maintenance receiver dropped");
            None
        }
    }
}

/// Requests cache eviction when the cache is full.
#[derive(Debug, Clone)]
pub struct CacheEvictionStrategy {
    signals: mpsc::UnboundedSender<MaintenanceSignal>,
}

impl CacheEvictionStrategy {
    /// Creates the strategy.
    pub fn new(signals: mpsc::UnboundedSender<MaintenanceSignal>) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl RecoveryStrategy for CacheEvictionStrategy {
    async fn recover(
        &self,
        _error: &QwenError,
        _context: &ErrorContext,
    ) -> QwenResult<Option<Value>> {
        Ok(send_signal(&self.signals, MaintenanceSignal::EvictCache))
    }
}

/// Requests a history purge when storage quota runs out.
#[derive(Debug, Clone)]
pub struct HistoryPurgeStrategy {
    signals: mpsc::UnboundedSender<MaintenanceSignal>,
}

impl HistoryPurgeStrategy {
    /// Creates the strategy.
    pub fn new(signals: mpsc::UnboundedSender<MaintenanceSignal>) -> Self {
        Self { signals }
    }
}

#[async_trait]
impl RecoveryStrategy for HistoryPurgeStrategy {
    async fn recover(
        &self,
        _error: &QwenError,
        _context: &ErrorContext,
    ) -> QwenResult<Option<Value>> {
        Ok(send_signal(&self.signals, MaintenanceSignal::PurgeStaleHistory))
    }
}

/// Suggests the next provider after a provider failure.
///
/// Providers are tried in preference order, skipping the failed one and any
/// listed under [`TRIED_PROVIDERS_KEY`] in the call or error context.
#[derive(Debug, Clone)]
pub struct ProviderFallbackStrategy {
    preferences: Vec<String>,
}

impl ProviderFallbackStrategy {
    /// Creates the strategy with providers in preference order.
    pub fn new<I, S>(preferences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            preferences: preferences.into_iter().map(Into::into).collect(),
        }
    }

    fn next_provider(&self, failed: Option<&str>, tried: &[&str]) -> Option<&str> {
        self.preferences
            .iter()
            .map(String::as_str)
            .find(|candidate| Some(*candidate) != failed && !tried.contains(candidate))
    }
}

fn tried_providers<'a>(contexts: [&'a ErrorContext; 2]) -> Vec<&'a str> {
    contexts
        .into_iter()
        .filter_map(|context| context.get(TRIED_PROVIDERS_KEY))
        .filter_map(Value::as_array)
        .flatten()
        .filter_map(Value::as_str)
        .collect()
}

#[async_trait]
impl RecoveryStrategy for ProviderFallbackStrategy {
    async fn recover(
        &self,
        error: &QwenError,
        context: &ErrorContext,
    ) -> QwenResult<Option<Value>> {
        let failed = match error.kind() {
            ErrorKind::ProviderFailure { provider, .. } => Some(provider.as_str()),
            _ => context.get("provider").and_then(Value::as_str),
        };
        let tried = tried_providers([context, error.context()]);

        Ok(self.next_provider(failed, &tried).map(|next| {
            json!({
                "action": "switch_provider",
                "provider": next,
                "failed_provider": failed,
            })
        }))
    }
}

impl ErrorManager {
    /// Registers the stock strategies.
    ///
    /// `CACHE_FULL` signals cache eviction, `QUOTA_EXCEEDED` signals a
    /// history purge and `PROVIDER_ERROR` suggests a fallback provider from
    /// `provider_preferences`.
    pub fn register_default_strategies(
        &self,
        signals: mpsc::UnboundedSender<MaintenanceSignal>,
        provider_preferences: Vec<String>,
    ) {
        self.add_recovery_strategy("CACHE_FULL", CacheEvictionStrategy::new(signals.clone()));
        self.add_recovery_strategy("QUOTA_EXCEEDED", HistoryPurgeStrategy::new(signals));
        self.add_recovery_strategy(
            "PROVIDER_ERROR",
            ProviderFallbackStrategy::new(provider_preferences),
        );
    }
}

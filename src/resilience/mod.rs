//! Request governance: admission control and failure handling.
//!
//! [`ThrottleManager`] decides when a provider call may start.
//! [`ErrorManager`] classifies failures and owns retry, deadlines and
//! recovery. [`Governor`] combines both for the common case.

mod bucket;
mod estimator;
mod manager;
mod recovery;
mod retry;
mod throttle;
mod timeout;

pub use estimator::{estimate_units, UnitCost};
pub use manager::{
    ErrorListener, ErrorManager, ErrorManagerConfig, ErrorStats, HistoryEntry, ListenerId,
    RecoveryOutcome, DEFAULT_STRATEGY_KEY,
};
pub use recovery::{
    strategy_fn, CacheEvictionStrategy, FnStrategy, HistoryPurgeStrategy, MaintenanceSignal,
    ProviderFallbackStrategy, RecoveryStrategy, TRIED_PROVIDERS_KEY,
};
pub use retry::{RetryCondition, RetryConfig, RetryObserver, RetryOptions};
pub use throttle::{ProviderUsage, ThrottleConfig, ThrottleManager};
pub use timeout::TimeoutKind;

use std::future::Future;
use std::sync::Arc;

use crate::config::GovernanceConfig;
use crate::errors::{BoxError, QwenResult};
use crate::observability::Logger;

/// Admission control and error handling for provider calls.
#[derive(Debug, Clone)]
pub struct Governor {
    throttle: Arc<ThrottleManager>,
    errors: Arc<ErrorManager>,
}

impl Governor {
    /// Builds both managers and configures every provider in `config`.
    pub fn new(config: &GovernanceConfig) -> QwenResult<Self> {
        let errors = ErrorManager::new(ErrorManagerConfig::from(config));
        Self::build(config, errors)
    }

    /// Like [`Governor::new`] with a custom log sink.
    pub fn with_logger(config: &GovernanceConfig, logger: Arc<dyn Logger>) -> QwenResult<Self> {
        let errors = ErrorManager::with_logger(ErrorManagerConfig::from(config), logger);
        Self::build(config, errors)
    }

    fn build(config: &GovernanceConfig, errors: ErrorManager) -> QwenResult<Self> {
        let throttle = ThrottleManager::new(config.throttle.clone());
        for (provider_id, limits) in &config.providers {
            throttle.configure(provider_id, limits)?;
        }
        Ok(Self::from_parts(Arc::new(throttle), Arc::new(errors)))
    }

    /// Combines existing managers.
    pub fn from_parts(throttle: Arc<ThrottleManager>, errors: Arc<ErrorManager>) -> Self {
        Self { throttle, errors }
    }

    /// Returns the admission controller.
    pub fn throttle(&self) -> &Arc<ThrottleManager> {
        &self.throttle
    }

    /// Returns the error manager.
    pub fn errors(&self) -> &Arc<ErrorManager> {
        &self.errors
    }

    /// Runs a provider call under admission control with retry.
    ///
    /// The cost is resolved once. Every attempt, retries included, first
    /// waits for permission, so a retry is charged like a fresh request.
    /// The operation is only invoked once its attempt is admitted.
    /// Admission refusals take part in retry like any other failure. The
    /// provider's `max_retries`, when configured, replaces the manager's
    /// budget unless `options` sets one.
    pub async fn execute<F, Fut, T, E>(
        &self,
        provider_id: &str,
        cost: impl Into<UnitCost>,
        operation: F,
        options: RetryOptions,
    ) -> QwenResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let units = cost.into().resolve()?;
        let throttle = self.throttle.as_ref();
        let operation = &operation;
        let mut options = options.context("provider", provider_id);
        if let Some(retries) = self
            .throttle
            .provider_config(provider_id)
            .and_then(|config| config.max_retries)
        {
            options = options.default_max_retries(retries);
        }

        self.errors
            .with_retry(
                move |attempt| async move {
                    throttle.request_permission(provider_id, units).await?;
                    let value = operation(attempt).await.map_err(Into::<BoxError>::into)?;
                    Ok::<T, BoxError>(value)
                },
                options,
            )
            .await
    }

    /// Stops the admission drain task and cancels queued requests.
    pub fn shutdown(&self) {
        self.throttle.shutdown();
    }
}

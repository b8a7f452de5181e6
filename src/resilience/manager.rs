//! Central error handling.
//!
//! [`ErrorManager::handle_error`] is the single funnel for failures: it
//! classifies, logs by severity, counts, records history, notifies listeners
//! and finally tries a registered recovery strategy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::recovery::RecoveryStrategy;
use super::retry::RetryConfig;
use crate::config::{GovernanceConfig, DEFAULT_MAX_HISTORY};
use crate::errors::{BoxError, ErrorContext, ErrorKind, QwenError, QwenResult};
use crate::observability::{level_for, Logger, TracingLogger};

/// Strategy key tried after the code and category keys.
pub const DEFAULT_STRATEGY_KEY: &str = "default";

/// Number of entries in [`ErrorStats::recent`].
const RECENT_ERRORS: usize = 10;

/// Error manager configuration.
#[derive(Debug, Clone)]
pub struct ErrorManagerConfig {
    /// Defaults for [`ErrorManager::with_retry`].
    pub retry: RetryConfig,
    /// Bound on recorded history entries.
    pub max_history: usize,
}

impl Default for ErrorManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

impl From<&GovernanceConfig> for ErrorManagerConfig {
    fn from(config: &GovernanceConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            max_history: config.max_history,
        }
    }
}

/// A handled error and the context it was handled with.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    /// The classified error.
    pub error: QwenError,
    /// Caller context passed to `handle_error`.
    pub context: ErrorContext,
    /// When the error was handled.
    pub timestamp: DateTime<Utc>,
}

/// Result of [`ErrorManager::handle_error`].
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// A strategy produced a replacement result.
    Recovered {
        /// Strategy output.
        result: Value,
    },
    /// No strategy applied or the strategy gave up.
    Unrecovered {
        /// The classified error.
        error: QwenError,
    },
}

impl RecoveryOutcome {
    /// Returns true if a strategy recovered.
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered { .. })
    }

    /// Converts into the recovered value or the error.
    pub fn into_result(self) -> QwenResult<Value> {
        match self {
            Self::Recovered { result } => Ok(result),
            Self::Unrecovered { error } => Err(error),
        }
    }
}

/// Observer of every handled error.
pub trait ErrorListener: Send + Sync {
    /// Called once per handled error, in registration order.
    fn on_error(&self, error: &QwenError, context: &ErrorContext);
}

impl<F> ErrorListener for F
where
    F: Fn(&QwenError, &ErrorContext) + Send + Sync,
{
    fn on_error(&self, error: &QwenError, context: &ErrorContext) {
        self(error, context);
    }
}

/// Handle returned by [`ErrorManager::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Snapshot of error statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStats {
    /// Sum of per-code counts.
    pub total_errors: u64,
    /// Count per error code.
    pub by_code: BTreeMap<String, u64>,
    /// Count per category over the recorded history.
    pub by_category: BTreeMap<String, u64>,
    /// Number of recorded history entries.
    pub history_len: usize,
    /// Up to the ten most recent entries, oldest first.
    pub recent: Vec<HistoryEntry>,
}

#[derive(Debug, Default)]
struct ErrorLedger {
    counts: HashMap<&'static str, u64>,
    history: VecDeque<HistoryEntry>,
}

type Listeners = Vec<(ListenerId, Arc<dyn ErrorListener>)>;

/// Classifies, records and recovers from failures.
pub struct ErrorManager {
    config: ErrorManagerConfig,
    logger: Arc<dyn Logger>,
    ledger: Mutex<ErrorLedger>,
    listeners: RwLock<Listeners>,
    strategies: RwLock<HashMap<String, Arc<dyn RecoveryStrategy>>>,
    next_listener: AtomicU64,
}

impl ErrorManager {
    /// Creates a manager that logs through `tracing`.
    pub fn new(config: ErrorManagerConfig) -> Self {
        Self::with_logger(config, Arc::new(TracingLogger))
    }

    /// Creates a manager with a custom log sink.
    pub fn with_logger(config: ErrorManagerConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            config,
            logger,
            ledger: Mutex::new(ErrorLedger::default()),
            listeners: RwLock::new(Vec::new()),
            strategies: RwLock::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ErrorManagerConfig {
        &self.config
    }

    /// Builds a typed error of the given kind.
    pub fn create_error(&self, kind: ErrorKind) -> QwenError {
        QwenError::new(kind)
    }

    /// Handles a failure.
    ///
    /// Steps, in order: classify (typed errors pass through), log at the
    /// severity's level, bump the per-code count, append to history (oldest
    /// entries evicted beyond `max_history`), notify listeners (a panicking
    /// listener is logged and skipped), then for recoverable errors run the
    /// first strategy registered under the error's code, its category or
    /// [`DEFAULT_STRATEGY_KEY`].
    pub async fn handle_error<E>(&self, failure: E, context: ErrorContext) -> RecoveryOutcome
    where
        E: Into<BoxError>,
    {
        let error = QwenError::wrap(failure, &context);

        self.log(&error, &context);
        self.record(&error, &context);
        self.notify_listeners(&error, &context);

        if !error.is_recoverable() {
            return RecoveryOutcome::Unrecovered { error };
        }

        let Some((key, strategy)) = self.find_strategy(&error) else {
            return RecoveryOutcome::Unrecovered { error };
        };

        match strategy.recover(&error, &context).await {
            Ok(Some(result)) => {
                info!(code = error.code(), strategy = %key, "Recovered from error");
                RecoveryOutcome::Recovered { result }
            }
            Ok(None) => {
                debug!(code = error.code(), strategy = %key, "Recovery strategy declined");
                RecoveryOutcome::Unrecovered { error }
            }
            Err(strategy_error) => {
                warn!(
                    code = error.code(),
                    strategy = %key,
                    error = %strategy_error,
                    "Recovery strategy failed"
                );
                RecoveryOutcome::Unrecovered { error }
            }
        }
    }

    fn log(&self, error: &QwenError, context: &ErrorContext) {
        let mut fields = error.context().clone();
        fields.extend(context.iter().map(|(k, v)| (k.clone(), v.clone())));
        fields.insert("code".to_string(), Value::from(error.code()));
        fields.insert("category".to_string(), Value::from(error.category().as_str()));

        self.logger
            .log(level_for(error.severity()), &error.to_string(), &fields);
    }

    fn record(&self, error: &QwenError, context: &ErrorContext) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        *ledger.counts.entry(error.code()).or_insert(0) += 1;

        ledger.history.push_back(HistoryEntry {
            error: error.clone(),
            context: context.clone(),
            timestamp: Utc::now(),
        });
        while ledger.history.len() > self.config.max_history {
            ledger.history.pop_front();
        }
    }

    fn notify_listeners(&self, error: &QwenError, context: &ErrorContext) {
        let listeners: Listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in listeners {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_error(error, context)));
            if delivered.is_err() {
                warn!(listener = ?id, code = error.code(), "Error listener panicked");
            }
        }
    }

    fn find_strategy(&self, error: &QwenError) -> Option<(String, Arc<dyn RecoveryStrategy>)> {
        let strategies = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        [error.code(), error.category().as_str(), DEFAULT_STRATEGY_KEY]
            .into_iter()
            .find_map(|key| {
                strategies
                    .get(key)
                    .map(|strategy| (key.to_string(), Arc::clone(strategy)))
            })
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: impl ErrorListener + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let listener: Arc<dyn ErrorListener> = Arc::new(listener);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    /// Registers `strategy` under an error code, a category name or
    /// [`DEFAULT_STRATEGY_KEY`], replacing any previous one.
    pub fn add_recovery_strategy(
        &self,
        key: impl Into<String>,
        strategy: impl RecoveryStrategy + 'static,
    ) {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Arc::new(strategy));
    }

    /// Removes the strategy under `key`.
    pub fn remove_recovery_strategy(&self, key: &str) -> bool {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Returns error statistics.
    pub fn get_stats(&self) -> ErrorStats {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);

        let by_code: BTreeMap<String, u64> = ledger
            .counts
            .iter()
            .map(|(code, count)| ((*code).to_string(), *count))
            .collect();

        let mut by_category = BTreeMap::new();
        for entry in &ledger.history {
            *by_category
                .entry(entry.error.category().as_str().to_string())
                .or_insert(0) += 1;
        }

        let skip = ledger.history.len().saturating_sub(RECENT_ERRORS);
        ErrorStats {
            total_errors: by_code.values().sum(),
            by_code,
            by_category,
            history_len: ledger.history.len(),
            recent: ledger.history.iter().skip(skip).cloned().collect(),
        }
    }

    /// Clears history and counts.
    pub fn clear_history(&self) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.history.clear();
        ledger.counts.clear();
    }

    /// Count recorded for `code`.
    pub fn error_count(&self, code: &str) -> u64 {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counts
            .get(code)
            .copied()
            .unwrap_or(0)
    }

    /// Recorded history, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub(crate) fn restore_error_count(&self, code: &'static str, count: u64) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        if count == 0 {
            ledger.counts.remove(code);
        } else {
            ledger.counts.insert(code, count);
        }
    }
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new(ErrorManagerConfig::default())
    }
}

impl std::fmt::Debug for ErrorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let strategies: Vec<String> = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();

        f.debug_struct("ErrorManager")
            .field("config", &self.config)
            .field("listeners", &listeners)
            .field("strategies", &strategies)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RateLimitReason;
    use crate::mocks::RecordingLogger;
    use crate::observability::{LogLevel, MockLogger};
    use crate::resilience::recovery::strategy_fn;
    use mockall::predicate::{always, eq};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn manager_with_history(max_history: usize) -> ErrorManager {
        ErrorManager::with_logger(
            ErrorManagerConfig {
                max_history,
                ..Default::default()
            },
            Arc::new(crate::observability::NoopLogger),
        )
    }

    fn cache_full() -> QwenError {
        QwenError::new(ErrorKind::CacheFull {
            entries: 500,
            max_entries: 500,
        })
    }

    #[tokio::test]
    async fn test_handle_error_records_and_counts() {
        let manager = manager_with_history(10);
        let outcome = manager
            .handle_error(
                QwenError::timeout("translate", Duration::from_millis(100)),
                ErrorContext::new(),
            )
            .await;

        assert!(!outcome.is_recovered());
        assert_eq!(manager.error_count("TIMEOUT"), 1);
        assert_eq!(manager.history().len(), 1);
        assert_eq!(manager.history()[0].error.code(), "TIMEOUT");
    }

    #[tokio::test]
    async fn test_untyped_failure_is_wrapped_with_context() {
        let manager = manager_with_history(10);
        let mut context = ErrorContext::new();
        context.insert("operation".into(), json!("translate"));

        let outcome = manager
            .handle_error(std::io::Error::other("socket closed"), context)
            .await;

        let RecoveryOutcome::Unrecovered { error } = outcome else {
            panic!("wrapped errors are not recoverable");
        };
        assert_eq!(error.code(), "WRAPPED_ERROR");
        assert_eq!(error.context()["operation"], "translate");
        assert_eq!(error.context()["original_error"], "socket closed");
    }

    #[tokio::test]
    async fn test_history_is_bounded_oldest_first() {
        let manager = manager_with_history(3);
        for i in 0..5u32 {
            let mut context = ErrorContext::new();
            context.insert("seq".into(), json!(i));
            manager.handle_error(cache_full(), context).await;
        }

        let seq: Vec<Value> = manager
            .history()
            .into_iter()
            .map(|entry| entry.context["seq"].clone())
            .collect();
        assert_eq!(seq, vec![json!(2), json!(3), json!(4)]);
        assert_eq!(manager.error_count("CACHE_FULL"), 5);
    }

    #[tokio::test]
    async fn test_logs_at_severity_level() {
        let mut logger = MockLogger::new();
        logger
            .expect_log()
            .with(eq(LogLevel::Error), always(), always())
            .times(1)
            .return_const(());
        logger
            .expect_log()
            .with(eq(LogLevel::Debug), always(), always())
            .times(1)
            .return_const(());

        let manager = ErrorManager::with_logger(ErrorManagerConfig::default(), Arc::new(logger));
        manager
            .handle_error(QwenError::invalid_provider("ghost"), ErrorContext::new())
            .await;
        manager.handle_error(cache_full(), ErrorContext::new()).await;
    }

    #[tokio::test]
    async fn test_log_context_carries_code_and_caller_fields() {
        let logger = Arc::new(RecordingLogger::new());
        let manager = ErrorManager::with_logger(ErrorManagerConfig::default(), logger.clone());

        let mut context = ErrorContext::new();
        context.insert("provider".into(), json!("qwen"));
        manager
            .handle_error(
                QwenError::rate_limited("qwen", RateLimitReason::Cancelled),
                context,
            )
            .await;

        let entries = logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, LogLevel::Warn);
        assert_eq!(entries[0].context["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(entries[0].context["category"], "rate_limit");
        assert_eq!(entries[0].context["provider"], "qwen");
    }

    #[tokio::test]
    async fn test_log_level_follows_severity() {
        let logger = Arc::new(RecordingLogger::new());
        let manager = ErrorManager::with_logger(ErrorManagerConfig::default(), logger.clone());

        manager.handle_error(cache_full(), ErrorContext::new()).await;
        manager
            .handle_error(
                QwenError::rate_limited("qwen", RateLimitReason::Cancelled),
                ErrorContext::new(),
            )
            .await;
        manager
            .handle_error(QwenError::invalid_provider("ghost"), ErrorContext::new())
            .await;
        assert_eq!(
            logger.levels(),
            vec![LogLevel::Debug, LogLevel::Warn, LogLevel::Error]
        );

        logger.clear();
        manager.handle_error("storage write failed", ErrorContext::new()).await;
        assert_eq!(logger.levels(), vec![LogLevel::Error]);
    }

    #[tokio::test]
    async fn test_listeners_notified_in_order_and_panics_isolated() {
        let manager = manager_with_history(10);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        manager.add_listener(move |_: &QwenError, _: &ErrorContext| {
            first.lock().unwrap().push("first");
        });
        manager.add_listener(|_: &QwenError, _: &ErrorContext| panic!("listener bug"));
        let third = Arc::clone(&order);
        manager.add_listener(move |error: &QwenError, _: &ErrorContext| {
            third.lock().unwrap().push(error.code());
        });

        manager.handle_error(cache_full(), ErrorContext::new()).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "CACHE_FULL"]);
    }

    #[tokio::test]
    async fn test_remove_listener() {
        let manager = manager_with_history(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = manager.add_listener(move |_: &QwenError, _: &ErrorContext| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.handle_error(cache_full(), ErrorContext::new()).await;
        assert!(manager.remove_listener(id));
        assert!(!manager.remove_listener(id));
        manager.handle_error(cache_full(), ErrorContext::new()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strategy_lookup_prefers_code_then_category_then_default() {
        let manager = manager_with_history(10);
        manager.add_recovery_strategy(
            "default",
            strategy_fn(|_, _| async { Ok(Some(json!("default"))) }),
        );
        manager.add_recovery_strategy(
            "storage",
            strategy_fn(|_, _| async { Ok(Some(json!("storage"))) }),
        );
        manager.add_recovery_strategy(
            "QUOTA_EXCEEDED",
            strategy_fn(|_, _| async { Ok(Some(json!("quota"))) }),
        );

        let quota = QwenError::new(ErrorKind::QuotaExceeded {
            message: "full".into(),
        });
        let storage = QwenError::new(ErrorKind::Storage {
            operation: "set".into(),
            message: "io".into(),
        });

        let recovered = |outcome: RecoveryOutcome| outcome.into_result().unwrap();
        assert_eq!(
            recovered(manager.handle_error(quota, ErrorContext::new()).await),
            json!("quota")
        );
        assert_eq!(
            recovered(manager.handle_error(storage, ErrorContext::new()).await),
            json!("storage")
        );
        assert_eq!(
            recovered(manager.handle_error(cache_full(), ErrorContext::new()).await),
            json!("default")
        );
    }

    #[tokio::test]
    async fn test_non_recoverable_errors_skip_strategies() {
        let manager = manager_with_history(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        manager.add_recovery_strategy(
            "default",
            strategy_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Some(json!(true))) }
            }),
        );

        let outcome = manager
            .handle_error(QwenError::configuration("bad"), ErrorContext::new())
            .await;

        assert!(!outcome.is_recovered());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_or_declining_strategy_is_unrecovered() {
        let manager = manager_with_history(10);
        manager.add_recovery_strategy(
            "CACHE_FULL",
            strategy_fn(|_, _| async { Err(QwenError::configuration("strategy broke")) }),
        );
        manager.add_recovery_strategy("TIMEOUT", strategy_fn(|_, _| async { Ok(None) }));

        let outcome = manager.handle_error(cache_full(), ErrorContext::new()).await;
        let RecoveryOutcome::Unrecovered { error } = outcome else {
            panic!("strategy failure must not recover");
        };
        assert_eq!(error.code(), "CACHE_FULL");

        let outcome = manager
            .handle_error(
                QwenError::timeout("translate", Duration::from_millis(1)),
                ErrorContext::new(),
            )
            .await;
        assert!(!outcome.is_recovered());
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let manager = manager_with_history(50);
        for _ in 0..12 {
            manager.handle_error(cache_full(), ErrorContext::new()).await;
        }
        manager
            .handle_error(QwenError::invalid_provider("ghost"), ErrorContext::new())
            .await;

        let stats = manager.get_stats();
        assert_eq!(stats.total_errors, 13);
        assert_eq!(stats.by_code["CACHE_FULL"], 12);
        assert_eq!(stats.by_code["INVALID_PROVIDER"], 1);
        assert_eq!(stats.by_category["cache"], 12);
        assert_eq!(stats.by_category["rate_limit"], 1);
        assert_eq!(stats.history_len, 13);
        assert_eq!(stats.recent.len(), 10);
        assert_eq!(stats.recent[9].error.code(), "INVALID_PROVIDER");

        manager.clear_history();
        let stats = manager.get_stats();
        assert_eq!(stats.total_errors, 0);
        assert!(stats.recent.is_empty());
    }

    #[test]
    fn test_create_error() {
        let manager = ErrorManager::default();
        let err = manager.create_error(ErrorKind::TabNotFound { tab_id: 7 });
        assert_eq!(err.code(), "TAB_NOT_FOUND");
        assert!(err.context().is_empty());
    }
}

//! Tests for error handling, retry and recovery.

use qwen_governance::errors::{ErrorContext, ErrorKind, QwenError};
use qwen_governance::resilience::{
    strategy_fn, ErrorManager, ErrorManagerConfig, MaintenanceSignal, RecoveryOutcome,
    RetryConfig, RetryOptions, TimeoutKind,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn quick_manager() -> ErrorManager {
    ErrorManager::new(ErrorManagerConfig {
        retry: RetryConfig::new()
            .max_retries(3)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(250))
            .jitter(false),
        max_history: 20,
    })
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_on_first_attempt() {
    let manager = quick_manager();
    let call_count = Arc::new(AtomicUsize::new(0));
    let count = call_count.clone();

    let result = manager
        .with_retry(
            move |_| {
                let c = count.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, QwenError>("success".to_string())
                }
            },
            RetryOptions::new(),
        )
        .await;

    assert_eq!(result.unwrap(), "success");
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_capped_by_max_delay() {
    let manager = quick_manager();
    let start = Instant::now();

    let result = manager
        .with_retry(
            |_| async { Err::<(), _>(QwenError::timeout("translate", Duration::from_secs(5))) },
            RetryOptions::new(),
        )
        .await;

    assert!(result.is_err());
    // 100 + 200 + 250 (capped).
    assert_eq!(start.elapsed(), Duration::from_millis(550));
    assert_eq!(manager.error_count("TIMEOUT"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovered_retry_restores_prior_count() {
    let manager = quick_manager();
    manager
        .handle_error(
            QwenError::timeout("translate", Duration::from_secs(1)),
            ErrorContext::new(),
        )
        .await;
    assert_eq!(manager.error_count("TIMEOUT"), 1);

    let call_count = Arc::new(AtomicUsize::new(0));
    let count = call_count.clone();
    manager
        .with_retry(
            move |_| {
                let n = count.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(QwenError::timeout("translate", Duration::from_secs(1)))
                    } else {
                        Ok(n)
                    }
                }
            },
            RetryOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(call_count.load(Ordering::SeqCst), 2);
    assert_eq!(manager.error_count("TIMEOUT"), 1);
    assert_eq!(manager.get_stats().total_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_are_not_retried() {
    let manager = quick_manager();
    let call_count = Arc::new(AtomicUsize::new(0));
    let count = call_count.clone();

    let err = manager
        .with_retry(
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(QwenError::provider_failure("qwen", "bad request", Some(400))) }
            },
            RetryOptions::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PROVIDER_ERROR");
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_recovery_through_default_strategies() {
    let manager = quick_manager();
    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.register_default_strategies(tx, vec!["qwen".into(), "google".into()]);

    let outcome: serde_json::Value = manager
        .with_timeout(
            async {
                Err(QwenError::new(ErrorKind::CacheFull {
                    entries: 1000,
                    max_entries: 1000,
                }))
            },
            Duration::from_secs(1),
            TimeoutKind::operation("cache.set"),
        )
        .await
        .unwrap();

    assert_eq!(outcome, json!({ "action": "evict_cache" }));
    assert_eq!(rx.try_recv().unwrap(), MaintenanceSignal::EvictCache);
}

#[tokio::test]
async fn test_listeners_and_custom_strategy() {
    let manager = quick_manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    manager.add_listener(move |error: &QwenError, context: &ErrorContext| {
        recorder
            .lock()
            .unwrap()
            .push((error.code(), context.get("tab").cloned()));
    });
    manager.add_recovery_strategy(
        "messaging",
        strategy_fn(|error, _| async move { Ok(Some(json!({ "reinjected": error.code() }))) }),
    );

    let mut context = ErrorContext::new();
    context.insert("tab".into(), json!(12));
    let outcome = manager
        .handle_error(
            QwenError::new(ErrorKind::MessageTimeout {
                message_type: "translatePage".into(),
                timeout: Duration::from_secs(5),
            }),
            context,
        )
        .await;

    let RecoveryOutcome::Recovered { result } = outcome else {
        panic!("messaging strategy should recover");
    };
    assert_eq!(result["reinjected"], "MESSAGE_TIMEOUT");
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("MESSAGE_TIMEOUT", Some(json!(12)))]
    );
}

#[tokio::test]
async fn test_stats_serialize_for_reporting() {
    let manager = quick_manager();
    manager
        .handle_error("storage write failed", ErrorContext::new())
        .await;

    let stats = serde_json::to_value(manager.get_stats()).unwrap();
    assert_eq!(stats["totalErrors"], 1);
    assert_eq!(stats["byCode"]["QUOTA_EXCEEDED"], 1);
    assert_eq!(stats["byCategory"]["storage"], 1);
    assert_eq!(stats["recent"][0]["error"]["code"], "QUOTA_EXCEEDED");
}

//! Tests for admission control.

use futures::future::join_all;
use qwen_governance::config::{parse_provider_table, ProviderLimits};
use qwen_governance::errors::{ErrorKind, RateLimitReason};
use qwen_governance::resilience::{ThrottleConfig, ThrottleManager};
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready_ok};

fn manager_with(id: &str, requests: u32, units: u64, window_ms: u64) -> ThrottleManager {
    let manager = ThrottleManager::default();
    manager
        .configure(
            id,
            &ProviderLimits::new(requests, units, Duration::from_millis(window_ms)),
        )
        .unwrap();
    manager
}

#[tokio::test(start_paused = true)]
async fn test_burst_within_limits_is_admitted_immediately() {
    let manager = manager_with("qwen", 5, 1000, 60_000);
    let start = Instant::now();

    for _ in 0..5 {
        manager.request_permission("qwen", 100u32).await.unwrap();
    }

    assert_eq!(start.elapsed(), Duration::ZERO);
    let usage = manager.get_usage("qwen").unwrap();
    assert_eq!(usage.requests_in_window, 5);
    assert_eq!(usage.units_in_window, 500);
    assert_eq!(usage.requests_remaining, 0);
    assert_eq!(usage.units_remaining, 500);
    assert_eq!(usage.throttled_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_stays_pending_until_refill() {
    let manager = manager_with("qwen", 1, 100, 1000);
    manager.request_permission("qwen", 10u32).await.unwrap();

    let mut waiting = tokio_test::task::spawn(manager.request_permission("qwen", 10u32));
    assert_pending!(waiting.poll());
    assert_eq!(manager.queue_len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_pending!(waiting.poll());

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_ready_ok!(waiting.poll());
    assert_eq!(manager.queue_len(), 0);
    assert_eq!(manager.get_usage("qwen").unwrap().throttled_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_admitted_in_arrival_order() {
    let manager = manager_with("qwen", 1, 100, 1000);
    let start = Instant::now();

    let admitted = join_all((0..3).map(|_| async {
        manager.request_permission("qwen", 1u32).await.unwrap();
        start.elapsed()
    }))
    .await;

    assert_eq!(admitted[0], Duration::ZERO);
    assert!(admitted[1] >= Duration::from_millis(1000));
    assert!(admitted[1] < Duration::from_millis(1100));
    assert!(admitted[2] >= Duration::from_millis(2000));
    assert!(admitted[2] < Duration::from_millis(2100));
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_rejects_with_retryable_error() {
    let manager = ThrottleManager::new(ThrottleConfig {
        queue_timeout: Duration::from_millis(500),
        ..Default::default()
    });
    manager
        .configure("qwen", &ProviderLimits::new(1, 100, Duration::from_secs(10)))
        .unwrap();
    manager.request_permission("qwen", 1u32).await.unwrap();

    let err = manager.request_permission("qwen", 1u32).await.unwrap_err();

    assert!(matches!(
        err.kind(),
        ErrorKind::RateLimitExceeded {
            reason: RateLimitReason::QueueTimeout { .. },
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(manager.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_providers_are_isolated() {
    let manager = manager_with("qwen", 1, 100, 1000);
    manager
        .configure("deepl", &ProviderLimits::new(1, 100, Duration::from_secs(1)))
        .unwrap();

    manager.request_permission("qwen", 1u32).await.unwrap();
    let mut qwen = tokio_test::task::spawn(manager.request_permission("qwen", 1u32));
    assert_pending!(qwen.poll());

    let start = Instant::now();
    manager.request_permission("deepl", 1u32).await.unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(manager.get_usage("deepl").unwrap().queued_requests, 0);
    assert_eq!(manager.get_usage("deepl").unwrap().total_queued, 1);
}

#[tokio::test(start_paused = true)]
async fn test_text_cost_is_estimated() {
    let manager = manager_with("qwen", 10, 1000, 60_000);
    manager
        .request_permission("qwen", "The quick brown fox")
        .await
        .unwrap();
    manager.request_permission("qwen", "你好世界").await.unwrap();

    assert_eq!(manager.get_usage("qwen").unwrap().units_in_window, 5 + 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_waiters() {
    let manager = manager_with("qwen", 1, 100, 60_000);
    manager.request_permission("qwen", 1u32).await.unwrap();

    let mut waiting = tokio_test::task::spawn(manager.request_permission("qwen", 1u32));
    assert_pending!(waiting.poll());

    manager.shutdown();
    let err = match waiting.poll() {
        std::task::Poll::Ready(result) => result.unwrap_err(),
        std::task::Poll::Pending => panic!("shutdown must settle queued requests"),
    };
    assert!(matches!(
        err.kind(),
        ErrorKind::RateLimitExceeded {
            reason: RateLimitReason::Cancelled,
            ..
        }
    ));
}

#[test]
fn test_usage_serializes_camel_case() {
    let manager = manager_with("qwen", 3, 300, 1000);
    let usage = serde_json::to_value(manager.get_usage("qwen").unwrap()).unwrap();

    assert_eq!(usage["providerId"], "qwen");
    assert_eq!(usage["requestLimit"], 3);
    assert_eq!(usage["unitLimit"], 300);
    assert_eq!(usage["windowMs"], 1000);
}

#[test]
fn test_configure_from_provider_table() {
    let table = parse_provider_table(
        r#"{
            "qwen": { "requestLimit": 60, "unitLimit": 100000, "windowMs": 60000 },
            "deepl": { "requestLimit": 10, "unitLimit": 5000, "windowMs": 1000, "maxQueueSize": 5 }
        }"#,
    )
    .unwrap();

    let manager = ThrottleManager::default();
    for (id, limits) in &table {
        manager.configure(id, limits).unwrap();
    }

    assert_eq!(manager.providers(), vec!["deepl", "qwen"]);
    assert_eq!(manager.provider_config("deepl").unwrap().max_queue_size, 5);
    assert_eq!(manager.provider_config("qwen").unwrap().window, Duration::from_secs(60));
}

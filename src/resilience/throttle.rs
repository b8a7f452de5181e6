//! Admission control across translation providers.
//!
//! Each provider owns a token bucket measured in requests and units. A
//! request that fits the bucket is admitted on the spot; otherwise it joins a
//! single queue shared by all providers, which a background drain task works
//! through oldest-first.

use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::bucket::Bucket;
use super::estimator::UnitCost;
use crate::config::{
    ProviderConfig, ProviderLimits, DEFAULT_DRAIN_BATCH_SIZE, DEFAULT_MAX_DRAIN_INTERVAL,
    DEFAULT_MIN_REFILL_INTERVAL, DEFAULT_QUEUE_TIMEOUT,
};
use crate::errors::{ErrorKind, QwenError, QwenResult, RateLimitReason};

/// Queue tuning shared by all providers.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// How long a request may stay queued before it is rejected.
    pub queue_timeout: Duration,
    /// Queued requests admitted per drain pass.
    pub drain_batch_size: usize,
    /// Upper bound on the pause between drain passes.
    pub max_drain_interval: Duration,
    /// Refills closer together than this are skipped.
    pub min_refill_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
            max_drain_interval: DEFAULT_MAX_DRAIN_INTERVAL,
            min_refill_interval: DEFAULT_MIN_REFILL_INTERVAL,
        }
    }
}

/// Usage snapshot of one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    /// Provider id.
    pub provider_id: String,
    /// Requests admitted within the trailing window.
    pub requests_in_window: usize,
    /// Units admitted within the trailing window.
    pub units_in_window: u64,
    /// Configured request limit.
    pub request_limit: u32,
    /// Configured unit limit.
    pub unit_limit: u64,
    /// Configured window in milliseconds.
    pub window_ms: u64,
    /// Request slots currently available.
    pub requests_remaining: u32,
    /// Units currently available.
    pub units_remaining: u64,
    /// Configured burst multiplier.
    pub burst_multiplier: f64,
    /// This provider's requests waiting in the shared queue.
    pub queued_requests: usize,
    /// All requests waiting in the shared queue.
    pub total_queued: usize,
    /// Requests admitted since configuration or the last reset.
    pub total_requests: u64,
    /// Units admitted since configuration or the last reset.
    pub total_units: u64,
    /// Requests that had to queue, across all providers.
    pub throttled_requests: u64,
}

struct QueuedRequest {
    provider_id: String,
    units: u64,
    responder: oneshot::Sender<QwenResult<()>>,
    enqueued_at: Instant,
    retry_count: u32,
}

impl QueuedRequest {
    fn settle(self, outcome: QwenResult<()>) {
        // The caller may have stopped waiting.
        let _ = self.responder.send(outcome);
    }
}

struct ProviderSlot {
    config: ProviderConfig,
    bucket: Bucket,
}

#[derive(Default)]
struct ThrottleState {
    providers: HashMap<String, ProviderSlot>,
    queue: VecDeque<QueuedRequest>,
    throttled_total: u64,
}

struct Shared {
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expires stale entries and admits what fits, oldest first.
    ///
    /// Returns the pause before the next pass, or `None` once the queue is
    /// empty. Within a provider the order is strict: once its oldest entry
    /// does not fit, younger entries for it wait too.
    fn drain_pass(&self, now: Instant) -> Option<Duration> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.queue.is_empty() {
            return None;
        }

        let mut pending = Vec::with_capacity(state.queue.len());
        for request in state.queue.drain(..) {
            if request.responder.is_closed() {
                debug!(provider = %request.provider_id, "Dropping abandoned request");
                continue;
            }
            let waited = now.saturating_duration_since(request.enqueued_at);
            if waited > self.config.queue_timeout {
                warn!(
                    provider = %request.provider_id,
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    "Queued request expired"
                );
                let provider = request.provider_id.clone();
                request.settle(Err(QwenError::rate_limited(
                    provider,
                    RateLimitReason::QueueTimeout { waited },
                )));
            } else {
                pending.push(request);
            }
        }
        pending.sort_by_key(|request| request.enqueued_at);

        let mut admitted = 0;
        let mut blocked: HashSet<String> = HashSet::new();
        let mut remaining = VecDeque::with_capacity(pending.len());
        for mut request in pending {
            if admitted >= self.config.drain_batch_size || blocked.contains(&request.provider_id) {
                remaining.push_back(request);
                continue;
            }
            let Some(slot) = state.providers.get_mut(&request.provider_id) else {
                let provider = request.provider_id.clone();
                request.settle(Err(QwenError::invalid_provider(provider)));
                continue;
            };

            slot.bucket
                .refill(&slot.config, now, self.config.min_refill_interval);
            if slot.bucket.can_admit(request.units) {
                slot.bucket.consume(request.units, now);
                admitted += 1;
                debug!(
                    provider = %request.provider_id,
                    units = request.units,
                    passes = request.retry_count,
                    "Admitted queued request"
                );
                request.settle(Ok(()));
            } else {
                request.retry_count += 1;
                blocked.insert(request.provider_id.clone());
                remaining.push_back(request);
            }
        }
        state.queue = remaining;

        if state.queue.is_empty() {
            return None;
        }
        let pause = state
            .queue
            .iter()
            .filter_map(|request| state.providers.get(&request.provider_id))
            .map(|slot| slot.config.retry_delay)
            .min()
            .unwrap_or(self.config.max_drain_interval)
            .max(self.config.min_refill_interval)
            .min(self.config.max_drain_interval);
        debug!(
            queued = state.queue.len(),
            admitted,
            pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
            "Drain pass finished"
        );
        Some(pause)
    }
}

async fn drain_loop(shared: Arc<Shared>) {
    loop {
        match shared.drain_pass(Instant::now()) {
            Some(pause) => {
                tokio::select! {
                    () = tokio::time::sleep(pause) => {}
                    () = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}

/// Per-provider admission controller.
///
/// The drain task is started on first use and stopped by
/// [`ThrottleManager::shutdown`] or when the manager is dropped.
pub struct ThrottleManager {
    shared: Arc<Shared>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl ThrottleManager {
    /// Creates a manager with no providers configured.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ThrottleState::default()),
                wake: Notify::new(),
            }),
            drain_task: Mutex::new(None),
        }
    }

    /// Configures or reconfigures a provider.
    ///
    /// A reconfigured provider keeps its bucket, clamped to the new limits.
    pub fn configure(&self, provider_id: &str, limits: &ProviderLimits) -> QwenResult<()> {
        let config = limits
            .resolve()
            .map_err(|e| e.with_context("provider", provider_id))?;
        let now = Instant::now();

        {
            let mut state = self.shared.lock();
            match state.providers.entry(provider_id.to_string()) {
                Entry::Occupied(mut entry) => {
                    let slot = entry.get_mut();
                    slot.bucket.clamp_to(&config);
                    slot.config = config;
                    info!(provider = provider_id, "Provider reconfigured");
                }
                Entry::Vacant(entry) => {
                    info!(
                        provider = provider_id,
                        request_limit = config.request_limit,
                        unit_limit = config.unit_limit,
                        "Provider configured"
                    );
                    entry.insert(ProviderSlot {
                        bucket: Bucket::new(&config, now),
                        config,
                    });
                }
            }
        }

        // New limits may unblock queued requests.
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Waits until `provider_id` may issue a request costing `cost`.
    ///
    /// Fails immediately for unknown providers, invalid costs, costs above
    /// the unit limit and a full queue. Otherwise returns at once if capacity
    /// is available, or queues until a drain pass admits the request, it
    /// expires, or the provider is removed.
    #[instrument(skip(self, cost))]
    pub async fn request_permission(
        &self,
        provider_id: &str,
        cost: impl Into<UnitCost>,
    ) -> QwenResult<()> {
        let cost = cost.into();
        let receiver = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;

            let slot = state
                .providers
                .get_mut(provider_id)
                .ok_or_else(|| QwenError::invalid_provider(provider_id))?;
            let units = cost.resolve()?;
            if units > slot.config.unit_limit {
                return Err(QwenError::rate_limited(
                    provider_id,
                    RateLimitReason::CostExceedsLimit {
                        units,
                        limit: slot.config.unit_limit,
                    },
                ));
            }
            if state.queue.len() >= slot.config.max_queue_size {
                return Err(QwenError::new(ErrorKind::QueueFull {
                    provider: provider_id.to_string(),
                    max_size: slot.config.max_queue_size,
                }));
            }

            let now = Instant::now();
            let waiting = state
                .queue
                .iter()
                .any(|request| request.provider_id == provider_id);
            if !waiting {
                slot.bucket
                    .refill(&slot.config, now, self.shared.config.min_refill_interval);
                if slot.bucket.can_admit(units) {
                    slot.bucket.consume(units, now);
                    debug!(units, "Admitted immediately");
                    return Ok(());
                }
            }

            let (sender, receiver) = oneshot::channel();
            state.queue.push_back(QueuedRequest {
                provider_id: provider_id.to_string(),
                units,
                responder: sender,
                enqueued_at: now,
                retry_count: 0,
            });
            state.throttled_total += 1;
            info!(units, queued = state.queue.len(), "Request throttled");
            receiver
        };

        self.ensure_drain_task();
        self.shared.wake.notify_one();

        receiver.await.unwrap_or_else(|_| {
            Err(QwenError::rate_limited(
                provider_id,
                RateLimitReason::Cancelled,
            ))
        })
    }

    fn ensure_drain_task(&self) {
        let mut task = self
            .drain_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *task = Some(tokio::spawn(drain_loop(Arc::clone(&self.shared))));
    }

    /// Returns the usage snapshot of a provider.
    pub fn get_usage(&self, provider_id: &str) -> QwenResult<ProviderUsage> {
        let now = Instant::now();
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        let slot = state
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| QwenError::invalid_provider(provider_id))?;
        slot.bucket
            .refill(&slot.config, now, self.shared.config.min_refill_interval);
        let (requests_in_window, units_in_window) =
            slot.bucket.window_usage(slot.config.window, now);

        Ok(ProviderUsage {
            provider_id: provider_id.to_string(),
            requests_in_window,
            units_in_window,
            request_limit: slot.config.request_limit,
            unit_limit: slot.config.unit_limit,
            window_ms: u64::try_from(slot.config.window.as_millis()).unwrap_or(u64::MAX),
            requests_remaining: slot.bucket.requests_remaining(),
            units_remaining: slot.bucket.units_remaining(),
            burst_multiplier: slot.config.burst_multiplier,
            queued_requests: state
                .queue
                .iter()
                .filter(|request| request.provider_id == provider_id)
                .count(),
            total_queued: state.queue.len(),
            total_requests: slot.bucket.total_requests(),
            total_units: slot.bucket.total_units(),
            throttled_requests: state.throttled_total,
        })
    }

    /// Estimates how long a request costing `cost` would wait right now.
    ///
    /// Informational only; admission does not consult it. Fails like
    /// [`ThrottleManager::request_permission`] for costs that can never be
    /// admitted.
    pub fn calculate_wait_time(
        &self,
        provider_id: &str,
        cost: impl Into<UnitCost>,
    ) -> QwenResult<Duration> {
        let now = Instant::now();
        let mut state = self.shared.lock();
        let slot = state
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| QwenError::invalid_provider(provider_id))?;
        let units = cost.into().resolve()?;
        if units > slot.config.unit_limit {
            return Err(QwenError::rate_limited(
                provider_id,
                RateLimitReason::CostExceedsLimit {
                    units,
                    limit: slot.config.unit_limit,
                },
            ));
        }
        slot.bucket
            .refill(&slot.config, now, self.shared.config.min_refill_interval);
        Ok(slot.bucket.wait_time(&slot.config, units))
    }

    /// Removes a provider and rejects its queued requests.
    ///
    /// Returns whether the provider was configured.
    pub fn remove_provider(&self, provider_id: &str) -> bool {
        let (existed, rejected) = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let existed = state.providers.remove(provider_id).is_some();
            let (rejected, kept): (Vec<_>, Vec<_>) = state
                .queue
                .drain(..)
                .partition(|request| request.provider_id == provider_id);
            state.queue = kept.into();
            (existed, rejected)
        };

        if existed || !rejected.is_empty() {
            info!(
                provider = provider_id,
                rejected = rejected.len(),
                "Provider removed"
            );
        }
        for request in rejected {
            request.settle(Err(QwenError::invalid_provider(provider_id)));
        }
        existed
    }

    /// Cancels every queued request. Returns how many were cancelled.
    pub fn clear_queue(&self) -> usize {
        let cancelled: Vec<_> = self.shared.lock().queue.drain(..).collect();
        let count = cancelled.len();
        for request in cancelled {
            let provider = request.provider_id.clone();
            request.settle(Err(QwenError::rate_limited(
                provider,
                RateLimitReason::Cancelled,
            )));
        }
        if count > 0 {
            info!(cancelled = count, "Queue cleared");
        }
        count
    }

    /// Restores full capacity and clears history for one provider, or for
    /// all providers (including the throttled counter) when `None`.
    pub fn reset_usage(&self, provider_id: Option<&str>) -> QwenResult<()> {
        let now = Instant::now();
        {
            let mut state = self.shared.lock();
            match provider_id {
                Some(id) => {
                    let slot = state
                        .providers
                        .get_mut(id)
                        .ok_or_else(|| QwenError::invalid_provider(id))?;
                    slot.bucket.reset(&slot.config, now);
                }
                None => {
                    for slot in state.providers.values_mut() {
                        slot.bucket.reset(&slot.config, now);
                    }
                    state.throttled_total = 0;
                }
            }
        }
        debug!(provider = ?provider_id, "Usage reset");
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Configured provider ids, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.lock().providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the validated configuration of a provider.
    pub fn provider_config(&self, provider_id: &str) -> Option<ProviderConfig> {
        self.shared
            .lock()
            .providers
            .get(provider_id)
            .map(|slot| slot.config.clone())
    }

    /// Number of requests waiting across all providers.
    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Stops the drain task and cancels all queued requests.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .drain_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.clear_queue();
    }
}

impl Default for ThrottleManager {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

impl Drop for ThrottleManager {
    fn drop(&mut self) {
        if let Some(task) = self
            .drain_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ThrottleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleManager")
            .field("config", &self.shared.config)
            .field("providers", &self.providers())
            .field("queued", &self.queue_len())
            .finish()
    }
}

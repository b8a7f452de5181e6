//! Per-provider token bucket.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ProviderConfig;

/// Live admission state of one provider.
///
/// Remaining counts stay within `0..=limit`. Refill is lazy: it happens when
/// an admission decision needs it, never on a timer.
#[derive(Debug)]
pub(crate) struct Bucket {
    units_remaining: u64,
    requests_remaining: u32,
    last_refill: Instant,
    // Fractional refill not yet credited.
    unit_carry: f64,
    request_carry: f64,
    unit_history: VecDeque<(Instant, u64)>,
    request_history: VecDeque<Instant>,
    total_requests: u64,
    total_units: u64,
}

impl Bucket {
    pub(crate) fn new(config: &ProviderConfig, now: Instant) -> Self {
        Self {
            units_remaining: config.unit_limit,
            requests_remaining: config.request_limit,
            last_refill: now,
            unit_carry: 0.0,
            request_carry: 0.0,
            unit_history: VecDeque::new(),
            request_history: VecDeque::new(),
            total_requests: 0,
            total_units: 0,
        }
    }

    pub(crate) fn units_remaining(&self) -> u64 {
        self.units_remaining
    }

    pub(crate) fn requests_remaining(&self) -> u32 {
        self.requests_remaining
    }

    pub(crate) fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub(crate) fn total_units(&self) -> u64 {
        self.total_units
    }

    /// Credits capacity accrued since the last refill.
    ///
    /// Each resource refills at `limit / window` per millisecond. Calls less
    /// than `min_interval` apart are no-ops.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub(crate) fn refill(&mut self, config: &ProviderConfig, now: Instant, min_interval: Duration) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed < min_interval {
            return;
        }

        let elapsed_ms = as_millis_f64(elapsed);
        let window_ms = as_millis_f64(config.window);

        let unit_gain = elapsed_ms * config.unit_limit as f64 / window_ms + self.unit_carry;
        let whole_units = unit_gain.floor();
        self.units_remaining = self
            .units_remaining
            .saturating_add(whole_units.min(u64::MAX as f64) as u64)
            .min(config.unit_limit);
        self.unit_carry = if self.units_remaining == config.unit_limit {
            0.0
        } else {
            unit_gain - whole_units
        };

        let request_gain =
            elapsed_ms * f64::from(config.request_limit) / window_ms + self.request_carry;
        let whole_requests = request_gain.floor();
        self.requests_remaining = self
            .requests_remaining
            .saturating_add(whole_requests.min(f64::from(u32::MAX)) as u32)
            .min(config.request_limit);
        self.request_carry = if self.requests_remaining == config.request_limit {
            0.0
        } else {
            request_gain - whole_requests
        };

        self.last_refill = now;
        self.prune(config.window, now);
    }

    /// Drops history entries older than the window.
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some((at, _)) = self.unit_history.front() {
            if now.saturating_duration_since(*at) > window {
                self.unit_history.pop_front();
            } else {
                break;
            }
        }
        while let Some(at) = self.request_history.front() {
            if now.saturating_duration_since(*at) > window {
                self.request_history.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn can_admit(&self, units: u64) -> bool {
        self.requests_remaining >= 1 && self.units_remaining >= units
    }

    /// Records an admitted request. Callers check [`Bucket::can_admit`] first.
    pub(crate) fn consume(&mut self, units: u64, now: Instant) {
        self.units_remaining = self.units_remaining.saturating_sub(units);
        self.requests_remaining = self.requests_remaining.saturating_sub(1);
        self.unit_history.push_back((now, units));
        self.request_history.push_back(now);
        self.total_requests += 1;
        self.total_units += units;
    }

    /// Clamps remaining capacity after a reconfiguration.
    pub(crate) fn clamp_to(&mut self, config: &ProviderConfig) {
        self.units_remaining = self.units_remaining.min(config.unit_limit);
        self.requests_remaining = self.requests_remaining.min(config.request_limit);
    }

    /// Restores full capacity and forgets all history.
    pub(crate) fn reset(&mut self, config: &ProviderConfig, now: Instant) {
        *self = Self::new(config, now);
    }

    /// Requests and units consumed within the trailing window.
    pub(crate) fn window_usage(&self, window: Duration, now: Instant) -> (usize, u64) {
        let in_window = |at: &Instant| now.saturating_duration_since(*at) <= window;
        let requests = self.request_history.iter().filter(|at| in_window(at)).count();
        let units = self
            .unit_history
            .iter()
            .filter(|(at, _)| in_window(at))
            .map(|(_, units)| units)
            .sum();
        (requests, units)
    }

    /// Estimated time until `units` could be admitted.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn wait_time(&self, config: &ProviderConfig, units: u64) -> Duration {
        let window_ms = as_millis_f64(config.window);
        let unit_rate = config.unit_limit as f64 / window_ms;
        let request_rate = f64::from(config.request_limit) / window_ms;

        let unit_deficit = units.saturating_sub(self.units_remaining) as f64;
        let request_deficit = if self.requests_remaining == 0 { 1.0 } else { 0.0 };

        let wait_ms = (unit_deficit / unit_rate).max(request_deficit / request_rate);
        Duration::try_from_secs_f64(wait_ms / 1000.0).unwrap_or(Duration::MAX)
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_millis_f64(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

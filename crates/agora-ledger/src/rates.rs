//! Rolling-window rate limits
//!
//! Usage is a per (principal, resource) deque of timestamped signed
//! deltas. Consumption appends a positive record, reconciliation
//! refunds append a negative one, and both age out of the window
//! together so a refund cannot outlive the usage it compensates.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Time source, injectable so window expiry is testable.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Wall-clock `Clock` used outside tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct UsageRecord {
    timestamp: f64,
    amount: f64,
}

/// Sliding-window usage tracker for metered resources.
pub struct RateTracker {
    window_seconds: f64,
    clock: Arc<dyn Clock>,
    limits: HashMap<String, f64>,
    usage: HashMap<(String, String), VecDeque<UsageRecord>>,
}

impl RateTracker {
    pub fn new(window_seconds: f64) -> Self {
        Self::with_clock(window_seconds, Arc::new(SystemClock))
    }

    pub fn with_clock(window_seconds: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_seconds,
            clock,
            limits: HashMap::new(),
            usage: HashMap::new(),
        }
    }

    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }

    /// Set the per-window cap for a resource. Negative caps are
    /// clamped to zero.
    pub fn configure_limit(&mut self, resource: &str, max_per_window: f64) {
        self.limits
            .insert(resource.to_string(), max_per_window.max(0.0));
    }

    /// Unconfigured resources are unlimited.
    pub fn limit(&self, resource: &str) -> f64 {
        self.limits.get(resource).copied().unwrap_or(f64::INFINITY)
    }

    pub fn configured_limits(&self) -> impl Iterator<Item = (&str, f64)> {
        self.limits.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn prune(&mut self, principal_id: &str, resource: &str) {
        let cutoff = self.clock.now() - self.window_seconds;
        if let Some(bucket) = self
            .usage
            .get_mut(&(principal_id.to_string(), resource.to_string()))
        {
            while bucket.front().is_some_and(|r| r.timestamp < cutoff) {
                bucket.pop_front();
            }
        }
    }

    /// Net usage inside the current window, floored at zero (refunds
    /// can transiently outweigh surviving consumption).
    pub fn usage(&mut self, principal_id: &str, resource: &str) -> f64 {
        self.prune(principal_id, resource);
        let total = self
            .usage
            .get(&(principal_id.to_string(), resource.to_string()))
            .map(|bucket| bucket.iter().map(|r| r.amount).sum())
            .unwrap_or(0.0);
        f64::max(0.0, total)
    }

    pub fn remaining(&mut self, principal_id: &str, resource: &str) -> f64 {
        let limit = self.limit(resource);
        let usage = self.usage(principal_id, resource);
        f64::max(0.0, limit - usage)
    }

    pub fn has_capacity(&mut self, principal_id: &str, resource: &str, amount: f64) -> bool {
        if amount < 0.0 {
            return false;
        }
        self.remaining(principal_id, resource) >= amount
    }

    /// Record consumption; false and no record when over the cap.
    pub fn consume(&mut self, principal_id: &str, resource: &str, amount: f64) -> bool {
        if amount < 0.0 {
            return false;
        }
        if amount == 0.0 {
            return true;
        }
        if !self.has_capacity(principal_id, resource, amount) {
            return false;
        }
        let timestamp = self.clock.now();
        self.usage
            .entry((principal_id.to_string(), resource.to_string()))
            .or_default()
            .push_back(UsageRecord { timestamp, amount });
        true
    }

    /// Credit back prior window usage, e.g. after an estimate turned
    /// out high or a downstream call failed.
    pub fn refund(&mut self, principal_id: &str, resource: &str, amount: f64) -> bool {
        if amount <= 0.0 {
            return false;
        }
        let timestamp = self.clock.now();
        self.usage
            .entry((principal_id.to_string(), resource.to_string()))
            .or_default()
            .push_back(UsageRecord {
                timestamp,
                amount: -amount,
            });
        true
    }

    /// Seconds until `amount` fits inside the window, assuming no new
    /// consumption. Walks records oldest-first until enough usage has
    /// expired to cover the excess.
    pub fn time_until_capacity(
        &mut self,
        principal_id: &str,
        resource: &str,
        amount: f64,
    ) -> f64 {
        if amount <= 0.0 {
            return 0.0;
        }
        if self.has_capacity(principal_id, resource, amount) {
            return 0.0;
        }
        self.prune(principal_id, resource);
        let limit = self.limit(resource);
        let now = self.clock.now();
        let Some(bucket) = self
            .usage
            .get(&(principal_id.to_string(), resource.to_string()))
        else {
            return 0.0;
        };
        if bucket.is_empty() {
            return 0.0;
        }
        let current: f64 = bucket.iter().map(|r| r.amount).sum();
        let need_to_expire = current - (limit - amount);
        if need_to_expire <= 0.0 {
            return 0.0;
        }
        let mut acc = 0.0;
        for record in bucket {
            acc += record.amount;
            if acc >= need_to_expire {
                return f64::max(0.0, record.timestamp + self.window_seconds - now);
            }
        }
        let last = bucket
            .back()
            .map(|r| r.timestamp)
            .unwrap_or(now);
        f64::max(0.0, last + self.window_seconds - now)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Manually advanced clock with millisecond resolution.
    #[derive(Default)]
    pub struct ManualClock {
        millis: AtomicU64,
    }

    impl ManualClock {
        pub fn advance(&self, seconds: f64) {
            self.millis
                .fetch_add((seconds * 1000.0) as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> f64 {
            self.millis.load(Ordering::SeqCst) as f64 / 1000.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;

    fn tracker(window: f64) -> (RateTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (RateTracker::with_clock(window, clock.clone()), clock)
    }

    #[test]
    fn consumption_expires_with_the_window() {
        let (mut rates, clock) = tracker(60.0);
        rates.configure_limit("llm_calls", 2.0);

        assert!(rates.consume("alpha_1", "llm_calls", 1.0));
        assert!(rates.consume("alpha_1", "llm_calls", 1.0));
        assert!(!rates.consume("alpha_1", "llm_calls", 1.0));

        clock.advance(61.0);
        assert!(rates.consume("alpha_1", "llm_calls", 1.0));
    }

    #[test]
    fn unconfigured_resource_is_unlimited() {
        let (mut rates, _clock) = tracker(60.0);
        assert!(rates.consume("alpha_1", "anything", 1_000_000.0));
        assert_eq!(rates.remaining("alpha_1", "anything"), f64::INFINITY);
    }

    #[test]
    fn refund_restores_capacity() {
        let (mut rates, _clock) = tracker(60.0);
        rates.configure_limit("llm_tokens", 100.0);

        assert!(rates.consume("alpha_1", "llm_tokens", 100.0));
        assert!(!rates.has_capacity("alpha_1", "llm_tokens", 1.0));
        assert!(rates.refund("alpha_1", "llm_tokens", 40.0));
        assert!(rates.has_capacity("alpha_1", "llm_tokens", 40.0));
        assert!(!rates.has_capacity("alpha_1", "llm_tokens", 41.0));
    }

    #[test]
    fn time_until_capacity_tracks_oldest_records() {
        let (mut rates, clock) = tracker(60.0);
        rates.configure_limit("cpu_seconds", 10.0);

        assert!(rates.consume("alpha_1", "cpu_seconds", 6.0));
        clock.advance(20.0);
        assert!(rates.consume("alpha_1", "cpu_seconds", 4.0));

        // Needs the first record (age 20s) to expire.
        let wait = rates.time_until_capacity("alpha_1", "cpu_seconds", 3.0);
        assert!((wait - 40.0).abs() < 0.01, "wait was {wait}");

        assert_eq!(rates.time_until_capacity("alpha_1", "cpu_seconds", 0.0), 0.0);
    }

    #[test]
    fn usage_is_per_principal() {
        let (mut rates, _clock) = tracker(60.0);
        rates.configure_limit("llm_calls", 1.0);

        assert!(rates.consume("alpha_1", "llm_calls", 1.0));
        assert!(rates.consume("alpha_2", "llm_calls", 1.0));
        assert!(!rates.consume("alpha_1", "llm_calls", 1.0));
    }

    #[test]
    fn negative_amounts_are_rejected() {
        let (mut rates, _clock) = tracker(60.0);
        rates.configure_limit("llm_calls", 5.0);
        assert!(!rates.consume("alpha_1", "llm_calls", -1.0));
        assert!(!rates.has_capacity("alpha_1", "llm_calls", -1.0));
        assert!(!rates.refund("alpha_1", "llm_calls", 0.0));
    }
}

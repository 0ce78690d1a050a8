//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciliations. Delays grow along the Fibonacci
//! sequence (1m, 1m, 2m, 3m, 5m, 8m, 10m max), which backs off more gently
//! than doubling.
//!
//! The reconciler itself never retries; [`RetryTracker`] belongs to the
//! trigger binding's error policy and is reset when a pass succeeds or the
//! WebPage is deleted. Entries that have not failed for twice the maximum
//! delay are dropped, which covers deletions the watch never reported.

use cluster_store::ObjectKey;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Fibonacci backoff calculator
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    max: Duration,
    prev: Duration,
    current: Duration,
}

impl FibonacciBackoff {
    /// Sequence starting at `min` for the first two values, capped at `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            max,
            prev: Duration::ZERO,
            current: min,
        }
    }

    /// Return the current delay and advance the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = next.min(self.max);
        result
    }
}

#[derive(Debug)]
struct RetryState {
    backoff: FibonacciBackoff,
    last_failure: Instant,
}

/// Per-object backoff state for the controller's error policy.
#[derive(Debug)]
pub struct RetryTracker {
    min: Duration,
    max: Duration,
    states: Mutex<HashMap<ObjectKey, RetryState>>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(600))
    }
}

impl RetryTracker {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn record_failure(&self, key: &ObjectKey) -> Duration {
        let now = Instant::now();
        // a failing object is retried at least every `max`
        let stale_after = self.max.saturating_mul(2);
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.retain(|_, state| now.duration_since(state.last_failure) <= stale_after);

        let state = states.entry(key.clone()).or_insert_with(|| RetryState {
            backoff: FibonacciBackoff::new(self.min, self.max),
            last_failure: now,
        });
        state.last_failure = now;
        state.backoff.next_backoff()
    }

    /// Forget the failure history of `key`, after a successful pass or
    /// once the WebPage is gone.
    pub fn forget(&self, key: &ObjectKey) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.states.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

//! Shared exponential-backoff policies.
//!
//! Retry windows differ per subsystem: preparation is wall-clock bounded,
//! task and compensation retries are attempt-bounded and capped elsewhere.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const MULTIPLIER: f64 = 2.0;
const JITTER: f64 = 0.1;

/// Preparation retry policy: 2 s initial, 10 s cap, 30 s total budget.
pub fn preparation_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(2))
        .with_max_interval(Duration::from_secs(10))
        .with_multiplier(MULTIPLIER)
        .with_randomization_factor(JITTER)
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .build()
}

/// Task execution retry policy: 2 s initial, 30 s cap, no elapsed bound
/// (the health grace period bounds it in time).
pub fn task_retry_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(2))
        .with_max_interval(Duration::from_secs(30))
        .with_multiplier(MULTIPLIER)
        .with_randomization_factor(JITTER)
        .with_max_elapsed_time(None)
        .build()
}

/// Compensation retry policy: 2 s initial, 1 min cap, bounded by attempts
/// and candidate TTL.
pub fn compensation_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(2))
        .with_max_interval(Duration::from_secs(60))
        .with_multiplier(MULTIPLIER)
        .with_randomization_factor(JITTER)
        .with_max_elapsed_time(None)
        .build()
}

/// Poll-loop friendly wrapper: yields the next delay without driving a
/// closure, and can be reset when the upstream recovers.
#[derive(Debug)]
pub struct BackoffState {
    inner: ExponentialBackoff,
}

impl BackoffState {
    pub fn new(inner: ExponentialBackoff) -> Self {
        Self { inner }
    }

    /// Next delay to sleep. Falls back to the cap when the policy is
    /// exhausted (attempt-bounded callers never reach that).
    pub fn next_delay(&mut self) -> Duration {
        self.inner
            .next_backoff()
            .unwrap_or(self.inner.max_interval)
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

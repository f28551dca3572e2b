//! Call statistics kept by each circuit breaker.

use std::time::SystemTime;

use serde::Serialize;

/// Statistics for the circuit breaker.
///
/// Lives inside the breaker's mutex, so plain integers are enough; every
/// mutation happens together with the transition check that reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakerStats {
    total_calls: u64,
    success_calls: u64,
    fail_calls: u64,
    consecutive_failures: u64,
    consecutive_successes: u64,
    last_failure_at: Option<SystemTime>,
    last_success_at: Option<SystemTime>,
}

impl BreakerStats {
    /// Creates a new empty stats tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful call.
    pub fn record_success(&mut self) {
        self.total_calls += 1;
        self.success_calls += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_success_at = Some(SystemTime::now());
    }

    /// Records a failed call.
    pub fn record_failure(&mut self) {
        self.total_calls += 1;
        self.fail_calls += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.last_failure_at = Some(SystemTime::now());
    }

    /// Total number of calls that produced an outcome.
    pub fn total_calls(&self) -> u64 {
        self.total_calls
    }

    /// Number of successful calls.
    pub fn success_calls(&self) -> u64 {
        self.success_calls
    }

    /// Number of failed calls, timeouts included.
    pub fn fail_calls(&self) -> u64 {
        self.fail_calls
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures
    }

    /// Successes since the last failure.
    pub fn consecutive_successes(&self) -> u64 {
        self.consecutive_successes
    }

    /// Wall-clock time of the last failure.
    pub fn last_failure_at(&self) -> Option<SystemTime> {
        self.last_failure_at
    }

    /// Wall-clock time of the last success.
    pub fn last_success_at(&self) -> Option<SystemTime> {
        self.last_success_at
    }

    /// Fraction of successful calls, `0.0` before any call.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.success_calls as f64 / self.total_calls as f64
    }

    /// Fraction of failed calls, `0.0` before any call.
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.fail_calls as f64 / self.total_calls as f64
    }

    pub(crate) fn counters(&self) -> (u64, u64) {
        (self.consecutive_failures, self.consecutive_successes)
    }

    /// Resets all statistics.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

//! Policy engine for circuit breaker trip and reset decisions.

use crate::stats::BreakerStats;

/// A policy that determines when to trip and reset a circuit breaker.
pub trait BreakerPolicy: Send + Sync + 'static {
    /// Determines if a closed circuit should trip open based on current stats.
    fn should_trip(&self, stats: &BreakerStats) -> bool;

    /// Determines if a half-open circuit should close based on current stats.
    fn should_reset(&self, stats: &BreakerStats) -> bool;
}

/// Trips on a run of consecutive failures, closes on a run of consecutive successes.
#[derive(Debug, Clone)]
pub struct ConsecutivePolicy {
    failure_threshold: u64,
    success_threshold: u64,
}

impl ConsecutivePolicy {
    /// Creates a new consecutive-count policy.
    pub fn new(failure_threshold: u64, success_threshold: u64) -> Self {
        Self {
            failure_threshold,
            success_threshold,
        }
    }
}

impl BreakerPolicy for ConsecutivePolicy {
    fn should_trip(&self, stats: &BreakerStats) -> bool {
        stats.consecutive_failures() >= self.failure_threshold
    }

    fn should_reset(&self, stats: &BreakerStats) -> bool {
        stats.consecutive_successes() >= self.success_threshold
    }
}

/// Policy based on error rate with a consecutive-failure backstop.
#[derive(Debug, Clone)]
pub struct FailureRatePolicy {
    failure_rate: f64,
    min_calls: u64,
    consecutive_failures_threshold: u64,
    consecutive_successes_threshold: u64,
}

impl FailureRatePolicy {
    /// Creates a new failure-rate policy.
    pub fn new(
        failure_rate: f64,
        min_calls: u64,
        consecutive_failures_threshold: u64,
        consecutive_successes_threshold: u64,
    ) -> Self {
        Self {
            failure_rate,
            min_calls,
            consecutive_failures_threshold,
            consecutive_successes_threshold,
        }
    }
}

impl BreakerPolicy for FailureRatePolicy {
    fn should_trip(&self, stats: &BreakerStats) -> bool {
        // Trip if error rate exceeds threshold and we have minimum throughput
        if stats.total_calls() >= self.min_calls && stats.failure_rate() >= self.failure_rate {
            return true;
        }

        stats.consecutive_failures() >= self.consecutive_failures_threshold
    }

    fn should_reset(&self, stats: &BreakerStats) -> bool {
        stats.consecutive_successes() >= self.consecutive_successes_threshold
    }
}

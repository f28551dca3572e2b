//! Sliding-window retry budget.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Caps the share of retries among requests seen within a time window.
///
/// Shared by every execution of one retrier (or several retriers, through an
/// `Arc`), so a failing dependency cannot multiply its own load.
#[derive(Debug)]
pub struct RetryBudget {
    ttl: Duration,
    max_ratio: f64,
    window: Mutex<BudgetWindow>,
}

#[derive(Debug, Default)]
struct BudgetWindow {
    requests: VecDeque<Instant>,
    retries: VecDeque<Instant>,
}

impl BudgetWindow {
    fn prune(&mut self, now: Instant, ttl: Duration) {
        let Some(cutoff) = now.checked_sub(ttl) else {
            return;
        };
        // Timestamps are appended in order, so stale entries sit at the front.
        while self.requests.front().is_some_and(|t| *t < cutoff) {
            self.requests.pop_front();
        }
        while self.retries.front().is_some_and(|t| *t < cutoff) {
            self.retries.pop_front();
        }
    }

    fn ratio(&self) -> f64 {
        if self.requests.is_empty() {
            return 0.0;
        }
        self.retries.len() as f64 / self.requests.len() as f64
    }
}

/// Budget counters within the current window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryBudgetStats {
    /// Requests inside the window.
    pub requests: usize,
    /// Retries inside the window.
    pub retries: usize,
    /// `retries / requests`, `0.0` without requests.
    pub ratio: f64,
    /// Configured cap.
    pub max_ratio: f64,
    /// Whether another retry would currently be allowed.
    pub can_retry: bool,
    /// Window length in seconds.
    pub ttl_sec: u64,
}

impl RetryBudget {
    /// Creates a budget over a `ttl` window allowing `retries / requests < max_ratio`.
    pub fn new(ttl: Duration, max_ratio: f64) -> Self {
        Self {
            ttl,
            max_ratio,
            window: Mutex::new(BudgetWindow::default()),
        }
    }

    /// Window length.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Configured cap.
    pub fn max_ratio(&self) -> f64 {
        self.max_ratio
    }

    /// Whether another retry fits in the budget.
    pub fn can_retry(&self) -> bool {
        let mut window = self.window.lock();
        window.prune(Instant::now(), self.ttl);
        window.requests.is_empty() || window.ratio() < self.max_ratio
    }

    /// Records the start of a logical request.
    pub fn record_request(&self) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.prune(now, self.ttl);
        window.requests.push_back(now);
    }

    /// Records one retry.
    pub fn record_retry(&self) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.prune(now, self.ttl);
        window.retries.push_back(now);
    }

    /// Counters within the current window.
    pub fn stats(&self) -> RetryBudgetStats {
        let mut window = self.window.lock();
        window.prune(Instant::now(), self.ttl);
        let ratio = window.ratio();
        RetryBudgetStats {
            requests: window.requests.len(),
            retries: window.retries.len(),
            ratio,
            max_ratio: self.max_ratio,
            can_retry: window.requests.is_empty() || ratio < self.max_ratio,
            ttl_sec: self.ttl.as_secs(),
        }
    }
}

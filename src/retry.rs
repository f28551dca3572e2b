//! Retry engine with configurable backoff, jitter and an optional retry budget.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::{RetryBudget, RetryBudgetStats};
use crate::config::{duration_from_secs, ensure};
use crate::error::{Classify, ConfigError, ErrorKind, RetryError};

/// Maps an attempt number to a base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay` every time.
    Fixed,
    /// `base_delay * multiplier^(k-1)`.
    Exponential,
    /// `base_delay * k`.
    Linear,
    /// `base_delay * fib(k)`.
    Fibonacci,
}

/// Randomization applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// Use the delay as is.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
    /// Uniform in `[base, max(last, base) * 3]`.
    Decorrelated,
}

/// Retry options. Delays are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Base delay in seconds.
    pub base_delay: f64,
    /// Cap applied to the pre-jitter delay, in seconds.
    pub max_delay: f64,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
    /// Backoff strategy.
    pub strategy: BackoffStrategy,
    /// Jitter mode.
    pub jitter: Jitter,
    /// Error kinds eligible for retry.
    pub retryable: SmallVec<[ErrorKind; 8]>,
    /// Error kinds never retried, even if also listed as retryable.
    pub non_retryable: SmallVec<[ErrorKind; 8]>,
    /// Attach a retry budget to the retrier.
    pub retry_budget_enabled: bool,
    /// Budget window in seconds.
    pub retry_budget_ttl_sec: u64,
    /// Budget cap on `retries / requests`.
    pub retry_budget_max_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            max_delay: 60.0,
            multiplier: 2.0,
            strategy: BackoffStrategy::Exponential,
            jitter: Jitter::Equal,
            retryable: SmallVec::from_slice(&ErrorKind::ALL),
            non_retryable: SmallVec::new(),
            retry_budget_enabled: false,
            retry_budget_ttl_sec: 3600,
            retry_budget_max_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    /// Many quick attempts with full jitter.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: 0.5,
            max_delay: 30.0,
            multiplier: 1.5,
            jitter: Jitter::Full,
            ..Self::default()
        }
    }

    /// Few, widely spaced attempts without jitter.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: 2.0,
            max_delay: 120.0,
            multiplier: 3.0,
            strategy: BackoffStrategy::Linear,
            jitter: Jitter::None,
            ..Self::default()
        }
    }

    /// Pre-jitter delay in seconds before the retry that follows attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> f64 {
        let k = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                self.base_delay * self.multiplier.powi(i32::try_from(k - 1).unwrap_or(i32::MAX))
            }
            BackoffStrategy::Linear => self.base_delay * f64::from(k),
            BackoffStrategy::Fibonacci => self.base_delay * fibonacci(k),
        };
        delay.min(self.max_delay)
    }

    /// Applies the configured jitter to `delay`, given the previous delay (seconds).
    pub fn apply_jitter(&self, delay: f64, last_delay: f64) -> f64 {
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => uniform(0.0, delay),
            Jitter::Equal => uniform(delay / 2.0, delay),
            Jitter::Decorrelated => uniform(self.base_delay, last_delay.max(self.base_delay) * 3.0),
        }
    }

    /// Whether an error of `kind` may be retried at all.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind) && !self.non_retryable.contains(&kind)
    }

    /// Checks value ranges, prefixing field names with `path`.
    pub fn validate(&self, path: &str) -> Result<(), ConfigError> {
        ensure(
            self.max_attempts >= 1,
            &format!("{path}.max_attempts"),
            "must be at least 1",
        )?;
        ensure(
            self.base_delay.is_finite() && self.base_delay >= 0.0,
            &format!("{path}.base_delay"),
            "must be a non-negative number of seconds",
        )?;
        ensure(
            self.max_delay.is_finite() && self.max_delay >= self.base_delay,
            &format!("{path}.max_delay"),
            "must be finite and not below base_delay",
        )?;
        ensure(
            self.multiplier.is_finite() && self.multiplier > 0.0,
            &format!("{path}.multiplier"),
            "must be positive",
        )?;
        ensure(
            self.retry_budget_max_ratio.is_finite() && self.retry_budget_max_ratio > 0.0,
            &format!("{path}.retry_budget_max_ratio"),
            "must be positive",
        )?;
        ensure(
            self.retry_budget_ttl_sec >= 1,
            &format!("{path}.retry_budget_ttl_sec"),
            "must be at least 1",
        )
    }
}

/// `fib(1) = fib(2) = 1`.
fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (1.0_f64, 1.0_f64);
    for _ in 2..n {
        let next = a + b;
        a = b;
        b = next;
    }
    b
}

fn uniform(low: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    rand::thread_rng().gen_range(low..=high)
}

/// One failed attempt, handed to callbacks and kept in the error history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Delay slept before this attempt (zero for the first).
    pub delay: Duration,
    /// Rendered error.
    pub error: String,
    /// Classification of the error.
    pub kind: ErrorKind,
    /// Wall-clock time of the failure.
    pub timestamp: SystemTime,
    /// Time since `execute` started.
    pub elapsed_total: Duration,
}

type RetryHook = Arc<dyn Fn(&RetryAttempt, Duration) + Send + Sync + 'static>;
type GiveupHook = Arc<dyn Fn(&RetryAttempt, &[RetryAttempt]) + Send + Sync + 'static>;

enum GiveUp {
    MaxAttempts,
    NonRetryable,
    Budget,
}

/// Executes units of work with backoff between failed attempts.
#[derive(Clone)]
pub struct Retrier {
    config: RetryConfig,
    budget: Option<Arc<RetryBudget>>,
    on_retry: Option<RetryHook>,
    on_giveup: Option<GiveupHook>,
}

impl Retrier {
    /// Creates a retrier; a private budget is attached if the config enables one.
    pub fn new(config: RetryConfig) -> Self {
        let budget = config.retry_budget_enabled.then(|| {
            Arc::new(RetryBudget::new(
                Duration::from_secs(config.retry_budget_ttl_sec),
                config.retry_budget_max_ratio,
            ))
        });
        Self {
            config,
            budget,
            on_retry: None,
            on_giveup: None,
        }
    }

    /// Uses `budget` instead of the configured one, e.g. to share it.
    pub fn with_budget(mut self, budget: Arc<RetryBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Callback run before each backoff sleep with the failed attempt and the delay.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&RetryAttempt, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Callback run when the retrier stops with the final attempt and the history.
    pub fn on_giveup<F>(mut self, f: F) -> Self
    where
        F: Fn(&RetryAttempt, &[RetryAttempt]) + Send + Sync + 'static,
    {
        self.on_giveup = Some(Arc::new(f));
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// The attached budget, if any.
    pub fn budget(&self) -> Option<&Arc<RetryBudget>> {
        self.budget.as_ref()
    }

    /// Budget counters, if a budget is attached.
    pub fn budget_stats(&self) -> Option<RetryBudgetStats> {
        self.budget.as_ref().map(|b| b.stats())
    }

    /// Delay to sleep after attempt `attempt`, jitter included.
    pub fn next_delay(&self, attempt: u32, last_delay: Duration) -> Duration {
        let base = self.config.backoff_delay(attempt);
        duration_from_secs(self.config.apply_jitter(base, last_delay.as_secs_f64()))
    }

    /// Runs `op` until it succeeds or the retry policy gives up.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.execute_with_cancel(&CancellationToken::new(), op).await
    }

    /// Like [`execute`](Self::execute), aborting promptly once `cancel` fires.
    ///
    /// Cancellation interrupts a pending backoff sleep and is checked before
    /// every attempt; an in-flight attempt is dropped.
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        if let Some(budget) = &self.budget {
            budget.record_request();
        }

        let started = Instant::now();
        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let mut last_delay = Duration::ZERO;
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let attempt_start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = op() => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = err.kind();
            warn!(
                attempt,
                kind = kind.as_str(),
                elapsed_ms = attempt_start.elapsed().as_millis() as u64,
                error = %err,
                "attempt failed"
            );
            attempts.push(RetryAttempt {
                attempt_number: attempt,
                delay: last_delay,
                error: err.to_string(),
                kind,
                timestamp: SystemTime::now(),
                elapsed_total: started.elapsed(),
            });

            if let Some(reason) = self.give_up_reason(attempt, kind) {
                return Err(self.give_up(reason, err, attempts));
            }

            let delay = self.next_delay(attempt, last_delay);
            last_delay = delay;
            if let Some(budget) = &self.budget {
                budget.record_retry();
            }
            if let (Some(hook), Some(last)) = (&self.on_retry, attempts.last()) {
                hook(last, delay);
            }
            info!(
                delay_ms = delay.as_millis() as u64,
                next_attempt = attempt + 1,
                max_attempts = self.config.max_attempts,
                "retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn give_up_reason(&self, attempt: u32, kind: ErrorKind) -> Option<GiveUp> {
        if attempt >= self.config.max_attempts {
            return Some(GiveUp::MaxAttempts);
        }
        if !self.config.is_retryable(kind) {
            return Some(GiveUp::NonRetryable);
        }
        if let Some(budget) = &self.budget {
            if !budget.can_retry() {
                warn!("retry budget exhausted, skipping retry");
                return Some(GiveUp::Budget);
            }
        }
        None
    }

    fn give_up<E>(&self, reason: GiveUp, err: E, attempts: Vec<RetryAttempt>) -> RetryError<E> {
        if let (Some(hook), Some(last)) = (&self.on_giveup, attempts.last()) {
            hook(last, &attempts);
        }
        debug!(attempts = attempts.len(), "giving up");

        match reason {
            GiveUp::MaxAttempts => RetryError::Exhausted {
                last_error: err,
                attempts,
            },
            GiveUp::NonRetryable => RetryError::NonRetryable {
                error: err,
                attempts,
            },
            GiveUp::Budget => RetryError::BudgetExhausted {
                last_error: err,
                attempts,
            },
        }
    }
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("config", &self.config)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

//! Core circuit breaker implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{BreakerBuilder, BreakerConfig};
use crate::error::{BreakerError, BreakerResult};
use crate::hook::HookRegistry;
use crate::policy::BreakerPolicy;
use crate::state::{State, StateChange, StateMachine};
use crate::stats::BreakerStats;

const RECENT_CHANGES: usize = 10;

/// State and counters, mutated together under one lock.
struct BreakerCore {
    machine: StateMachine,
    stats: BreakerStats,
}

/// Inner state of the circuit breaker, shared between clones.
struct BreakerInner {
    name: String,
    config: BreakerConfig,
    policy: Arc<dyn BreakerPolicy>,
    core: Mutex<BreakerCore>,
    hooks: Arc<HookRegistry>,
}

/// A circuit breaker that gates calls to one named dependency.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

/// Point-in-time view of a breaker, suitable for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: State,
    /// Call statistics.
    pub stats: BreakerStats,
    /// Fraction of successful calls.
    pub success_rate: f64,
    /// Fraction of failed calls.
    pub failure_rate: f64,
    /// Active configuration.
    pub config: BreakerConfig,
    /// Wall-clock time at which an open breaker admits a probe.
    pub next_attempt_at: Option<SystemTime>,
    /// Time left until an open breaker admits a probe.
    pub retry_after: Option<Duration>,
    /// Time since the last transition.
    pub time_in_state: Duration,
    /// Most recent transitions, oldest first.
    pub recent_state_changes: Vec<StateChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// Tracks an admitted call; a dropped guard hands its probe slot back.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    armed: bool,
}

impl<'a> CallGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            armed: true,
        }
    }

    fn finish(mut self, outcome: Outcome, elapsed: Duration) {
        self.armed = false;
        self.breaker.post_call(self.probe, outcome, elapsed);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.probe {
            self.breaker.inner.core.lock().machine.release_probe();
        }
    }
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the specified policy and settings.
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        policy: Arc<dyn BreakerPolicy>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_sec = config.recovery_timeout_sec,
            success_threshold = config.success_threshold,
            call_timeout_sec = config.call_timeout_sec,
            "circuit breaker initialized"
        );

        let inner = BreakerInner {
            name,
            config,
            policy,
            core: Mutex::new(BreakerCore {
                machine: StateMachine::new(),
                stats: BreakerStats::new(),
            }),
            hooks,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for customizing a circuit breaker.
    pub fn builder(name: impl Into<String>) -> BreakerBuilder {
        BreakerBuilder::new(name)
    }

    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Active configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Gets the current state of the circuit breaker.
    pub fn current_state(&self) -> State {
        self.inner.core.lock().machine.current()
    }

    /// Copy of the current statistics.
    pub fn stats(&self) -> BreakerStats {
        self.inner.core.lock().stats.clone()
    }

    /// Executes `f` through the breaker; every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(f, |_| true).await
    }

    /// Executes `f` through the breaker.
    ///
    /// Errors for which `is_failure` returns `false` are passed through without
    /// touching the statistics.
    pub async fn call_filtered<F, Fut, T, E, P>(&self, f: F, is_failure: P) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let probe = self.pre_call::<E>()?;
        let guard = CallGuard::new(self, probe);

        let timeout = self.inner.config.call_timeout();
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, f()).await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(value)) => {
                guard.finish(Outcome::Success, elapsed);
                Ok(value)
            }
            Ok(Err(err)) => {
                let outcome = if is_failure(&err) {
                    Outcome::Failure
                } else {
                    Outcome::Ignored
                };
                guard.finish(outcome, elapsed);
                Err(BreakerError::Operation(err))
            }
            Err(_) => {
                warn!(breaker = %self.inner.name, ?timeout, "call timed out");
                guard.finish(Outcome::Failure, elapsed);
                Err(BreakerError::Timeout {
                    name: self.inner.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Checks if a call is allowed; returns whether it occupies a probe slot.
    fn pre_call<E>(&self) -> Result<bool, BreakerError<E>> {
        let now = Instant::now();
        let probes = u64::from(self.inner.config.success_threshold.max(1));

        let (admission, transitioned) = {
            let mut core = self.inner.core.lock();
            let BreakerCore { machine, stats } = &mut *core;
            match machine.current() {
                State::Closed => (Ok(false), false),
                State::Open => match machine.next_attempt_at() {
                    Some(at) if now < at => (Err(at - now), false),
                    _ => {
                        machine.attempt_half_open(probes, stats.counters());
                        machine.take_probe();
                        (Ok(true), true)
                    }
                },
                State::HalfOpen => {
                    if machine.take_probe() {
                        (Ok(true), false)
                    } else {
                        (Err(Duration::ZERO), false)
                    }
                }
            }
        };

        if transitioned {
            self.announce(State::Open, State::HalfOpen);
        }

        admission.map_err(|retry_after| BreakerError::Open {
            name: self.inner.name.clone(),
            retry_after,
        })
    }

    /// Processes the result of a call to update stats and potentially change state.
    fn post_call(&self, probe: bool, outcome: Outcome, elapsed: Duration) {
        let recovery = self.inner.config.recovery_timeout();
        let policy = &self.inner.policy;

        let transition = {
            let mut core = self.inner.core.lock();
            let BreakerCore { machine, stats } = &mut *core;
            match outcome {
                Outcome::Ignored => {
                    if probe {
                        machine.release_probe();
                    }
                    None
                }
                Outcome::Success => {
                    stats.record_success();
                    if machine.current() != State::HalfOpen {
                        None
                    } else if policy.should_reset(stats) && machine.reset_closed(stats.counters())
                    {
                        Some((State::HalfOpen, State::Closed))
                    } else {
                        // Still undecided: the slot goes back to the next probe.
                        if probe {
                            machine.release_probe();
                        }
                        None
                    }
                }
                Outcome::Failure => {
                    stats.record_failure();
                    match machine.current() {
                        State::HalfOpen if machine.revert_to_open(recovery, stats.counters()) => {
                            Some((State::HalfOpen, State::Open))
                        }
                        State::Closed
                            if policy.should_trip(stats)
                                && machine.trip_open(recovery, stats.counters()) =>
                        {
                            Some((State::Closed, State::Open))
                        }
                        _ => None,
                    }
                }
            }
        };

        match outcome {
            Outcome::Success => self.inner.hooks.execute_success_hook(&self.inner.name, elapsed),
            Outcome::Failure => self.inner.hooks.execute_failure_hook(&self.inner.name, elapsed),
            Outcome::Ignored => {}
        }

        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    fn announce(&self, from: State, to: State) {
        warn!(breaker = %self.inner.name, %from, %to, "circuit breaker state changed");
        self.inner
            .hooks
            .execute_state_transition_hook(&self.inner.name, from, to);
    }

    /// Snapshot of state, statistics and configuration.
    pub fn status(&self) -> BreakerStatus {
        let core = self.inner.core.lock();
        BreakerStatus {
            name: self.inner.name.clone(),
            state: core.machine.current(),
            stats: core.stats.clone(),
            success_rate: core.stats.success_rate(),
            failure_rate: core.stats.failure_rate(),
            config: self.inner.config.clone(),
            next_attempt_at: core.machine.next_attempt_wall(),
            retry_after: core.machine.retry_after(Instant::now()),
            time_in_state: core.machine.time_in_state(),
            recent_state_changes: core.machine.recent_changes(RECENT_CHANGES),
        }
    }

    /// Forces the circuit breaker to the open state.
    pub fn force_open(&self) -> bool {
        let recovery = self.inner.config.recovery_timeout();
        let from = {
            let mut core = self.inner.core.lock();
            let BreakerCore { machine, stats } = &mut *core;
            let from = machine.current();
            machine.trip_open(recovery, stats.counters()).then_some(from)
        };

        match from {
            Some(from) => {
                self.announce(from, State::Open);
                true
            }
            None => false,
        }
    }

    /// Forces the closed state and clears all statistics.
    pub fn reset(&self) {
        let previous = {
            let mut core = self.inner.core.lock();
            let previous = core.machine.current();
            core.machine.clear();
            core.stats.reset();
            previous
        };

        info!(breaker = %self.inner.name, "circuit breaker reset");
        if previous != State::Closed {
            self.inner
                .hooks
                .execute_state_transition_hook(&self.inner.name, previous, State::Closed);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.current_state())
            .finish()
    }
}

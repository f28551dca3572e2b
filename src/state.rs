//! Circuit breaker state machine implementation.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::time::Instant;

const STATE_LOG_CAPACITY: usize = 50;

// Stand-in for recovery timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed = 0,

    /// Circuit is open and operations are rejected.
    Open = 1,

    /// Circuit is allowing a limited number of operations to test recovery.
    HalfOpen = 2,
}

impl State {
    /// Numeric encoding used by the `circuit_breaker_state` gauge.
    pub fn as_gauge(self) -> f64 {
        self as u8 as f64
    }

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    /// State before the transition.
    pub from: State,
    /// State after the transition.
    pub to: State,
    /// Wall-clock time of the transition.
    pub at: SystemTime,
    /// Consecutive failures at the moment of the transition.
    pub consecutive_failures: u64,
    /// Consecutive successes at the moment of the transition.
    pub consecutive_successes: u64,
}

/// Transition bookkeeping for one breaker. Always accessed under the breaker's lock.
#[derive(Debug)]
pub(crate) struct StateMachine {
    state: State,
    last_transition: Instant,
    next_attempt_at: Option<Instant>,
    next_attempt_wall: Option<SystemTime>,
    probes_remaining: u64,
    log: VecDeque<StateChange>,
}

impl StateMachine {
    /// Creates a new state machine in the closed state.
    pub(crate) fn new() -> Self {
        Self {
            state: State::Closed,
            last_transition: Instant::now(),
            next_attempt_at: None,
            next_attempt_wall: None,
            probes_remaining: 0,
            log: VecDeque::with_capacity(STATE_LOG_CAPACITY),
        }
    }

    pub(crate) fn current(&self) -> State {
        self.state
    }

    pub(crate) fn time_in_state(&self) -> Duration {
        self.last_transition.elapsed()
    }

    pub(crate) fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    pub(crate) fn next_attempt_wall(&self) -> Option<SystemTime> {
        self.next_attempt_wall
    }

    /// Time left before an open breaker admits a probe.
    pub(crate) fn retry_after(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.next_attempt_at) {
            (State::Open, Some(at)) => Some(at.saturating_duration_since(now)),
            _ => None,
        }
    }

    pub(crate) fn recent_changes(&self, limit: usize) -> Vec<StateChange> {
        let skip = self.log.len().saturating_sub(limit);
        self.log.iter().skip(skip).cloned().collect()
    }

    /// Claims one half-open probe slot.
    pub(crate) fn take_probe(&mut self) -> bool {
        if self.state == State::HalfOpen && self.probes_remaining > 0 {
            self.probes_remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Returns a probe slot whose call never produced an outcome.
    pub(crate) fn release_probe(&mut self) {
        if self.state == State::HalfOpen {
            self.probes_remaining += 1;
        }
    }

    /// Moves to open from closed or half-open, scheduling the next probe.
    pub(crate) fn trip_open(&mut self, recovery: Duration, counters: (u64, u64)) -> bool {
        if self.state == State::Open {
            return false;
        }
        self.transition(State::Open, counters);
        let now = Instant::now();
        self.next_attempt_at = Some(now.checked_add(recovery).unwrap_or(now + FAR_FUTURE));
        self.next_attempt_wall = SystemTime::now().checked_add(recovery);
        true
    }

    /// Moves from open to half-open, arming `probes` probe slots.
    pub(crate) fn attempt_half_open(&mut self, probes: u64, counters: (u64, u64)) -> bool {
        if self.state != State::Open {
            return false;
        }
        self.transition(State::HalfOpen, counters);
        self.probes_remaining = probes;
        true
    }

    /// Moves from half-open to closed after a successful recovery.
    pub(crate) fn reset_closed(&mut self, counters: (u64, u64)) -> bool {
        if self.state != State::HalfOpen {
            return false;
        }
        self.transition(State::Closed, counters);
        self.next_attempt_at = None;
        self.next_attempt_wall = None;
        true
    }

    /// Reverts from half-open to open after a failed probe.
    pub(crate) fn revert_to_open(&mut self, recovery: Duration, counters: (u64, u64)) -> bool {
        if self.state != State::HalfOpen {
            return false;
        }
        self.trip_open(recovery, counters)
    }

    /// Forces the closed state and forgets history.
    pub(crate) fn clear(&mut self) {
        *self = Self::new();
    }

    fn transition(&mut self, to: State, (consecutive_failures, consecutive_successes): (u64, u64)) {
        if self.log.len() == STATE_LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(StateChange {
            from: self.state,
            to,
            at: SystemTime::now(),
            consecutive_failures,
            consecutive_successes,
        });
        self.state = to;
        self.last_transition = Instant::now();
        self.probes_remaining = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_allowed_edges() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.current(), State::Closed);

        assert!(!machine.reset_closed((0, 0)));
        assert!(!machine.attempt_half_open(1, (0, 0)));

        assert!(machine.trip_open(Duration::from_secs(1), (3, 0)));
        assert!(!machine.trip_open(Duration::from_secs(1), (3, 0)));
        assert!(machine.next_attempt_at().is_some());

        assert!(machine.attempt_half_open(2, (3, 0)));
        assert!(machine.take_probe());
        assert!(machine.take_probe());
        assert!(!machine.take_probe());
        machine.release_probe();
        assert!(machine.take_probe());

        assert!(machine.reset_closed((0, 2)));
        assert!(machine.next_attempt_at().is_none());
        assert_eq!(machine.recent_changes(10).len(), 3);
    }

    #[test]
    fn log_is_bounded() {
        let mut machine = StateMachine::new();
        for _ in 0..40 {
            machine.trip_open(Duration::ZERO, (1, 0));
            machine.attempt_half_open(1, (1, 0));
        }
        assert_eq!(machine.recent_changes(usize::MAX).len(), STATE_LOG_CAPACITY);
        assert_eq!(machine.recent_changes(10).len(), 10);
    }
}

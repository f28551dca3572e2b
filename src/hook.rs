//! Hook registry for circuit breaker events.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::state::State;

type HookFn = Arc<dyn Fn(&str) + Send + Sync + 'static>;
type CallHookFn = Arc<dyn Fn(&str, Duration) + Send + Sync + 'static>;
type TransitionFn = Arc<dyn Fn(&str, State, State) + Send + Sync + 'static>;

/// A registry for circuit breaker event hooks.
///
/// Every hook receives the breaker name. Hooks run after the breaker lock has
/// been released, so they may freely call back into the breaker.
pub struct HookRegistry {
    on_open: RwLock<Option<HookFn>>,
    on_close: RwLock<Option<HookFn>>,
    on_half_open: RwLock<Option<HookFn>>,
    on_success: RwLock<Option<CallHookFn>>,
    on_failure: RwLock<Option<CallHookFn>>,
    transition_listeners: RwLock<Vec<TransitionFn>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates a new empty hook registry.
    pub fn new() -> Self {
        Self {
            on_open: RwLock::new(None),
            on_close: RwLock::new(None),
            on_half_open: RwLock::new(None),
            on_success: RwLock::new(None),
            on_failure: RwLock::new(None),
            transition_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Sets the hook to call when a circuit breaker opens.
    pub fn set_on_open<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a circuit breaker closes.
    pub fn set_on_close<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_close.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a circuit breaker half-opens.
    pub fn set_on_half_open<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_half_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a call succeeds.
    pub fn set_on_success<F>(&self, f: F)
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        *self.on_success.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a call fails.
    pub fn set_on_failure<F>(&self, f: F)
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        *self.on_failure.write() = Some(Arc::new(f));
    }

    /// Adds a listener invoked on every state transition with `(name, from, to)`.
    pub fn add_transition_listener<F>(&self, f: F)
    where
        F: Fn(&str, State, State) + Send + Sync + 'static,
    {
        self.transition_listeners.write().push(Arc::new(f));
    }

    /// Executes the hooks registered for a state transition.
    pub fn execute_state_transition_hook(&self, name: &str, from: State, to: State) {
        let slot = match to {
            State::Open => &self.on_open,
            State::Closed => &self.on_close,
            State::HalfOpen => &self.on_half_open,
        };
        let hook = slot.read().clone();
        if let Some(hook) = hook {
            hook(name);
        }

        let listeners = self.transition_listeners.read().clone();
        for listener in listeners {
            listener(name, from, to);
        }
    }

    /// Executes the success hook.
    pub fn execute_success_hook(&self, name: &str, elapsed: Duration) {
        let hook = self.on_success.read().clone();
        if let Some(hook) = hook {
            hook(name, elapsed);
        }
    }

    /// Executes the failure hook.
    pub fn execute_failure_hook(&self, name: &str, elapsed: Duration) {
        let hook = self.on_failure.read().clone();
        if let Some(hook) = hook {
            hook(name, elapsed);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("transition_listeners", &self.transition_listeners.read().len())
            .finish_non_exhaustive()
    }
}

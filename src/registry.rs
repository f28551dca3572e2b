//! Name-keyed registry of circuit breakers.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tracing::info;

use crate::breaker::{BreakerStatus, CircuitBreaker};
use crate::config::{BreakerBuilder, BreakerConfig};
use crate::hook::HookRegistry;
use crate::state::State;

/// Breakers created lazily by name and kept for the life of the registry.
///
/// Lookups take a read lock; the write lock is only taken to insert a new
/// breaker, so calls through different breakers never contend here.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<AHashMap<String, CircuitBreaker>>,
    defaults: BreakerConfig,
    hooks: Arc<HookRegistry>,
}

/// Number of breakers per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BreakerCounts {
    /// All registered breakers.
    pub total: usize,
    /// Breakers in the closed state.
    pub closed: usize,
    /// Breakers in the open state.
    pub open: usize,
    /// Breakers in the half-open state.
    pub half_open: usize,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry whose lazily created breakers use `defaults`.
    pub fn new(defaults: BreakerConfig) -> Self {
        Self::with_hooks(defaults, Arc::new(HookRegistry::new()))
    }

    /// Creates an empty registry that attaches `hooks` to every breaker.
    pub fn with_hooks(defaults: BreakerConfig, hooks: Arc<HookRegistry>) -> Self {
        Self {
            breakers: RwLock::new(AHashMap::new()),
            defaults,
            hooks,
        }
    }

    /// Hooks shared by every breaker of this registry.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Returns the breaker for `name`, creating it with the default config.
    pub fn breaker(&self, name: &str) -> CircuitBreaker {
        self.get_or_create(name, None)
    }

    /// Returns the breaker for `name`, creating it with `config` (or the
    /// defaults) if absent. An existing breaker keeps its original config.
    pub fn get_or_create(&self, name: &str, config: Option<&BreakerConfig>) -> CircuitBreaker {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                BreakerBuilder::new(name)
                    .config(config.unwrap_or(&self.defaults).clone())
                    .hooks(Arc::clone(&self.hooks))
                    .build()
            })
            .clone()
    }

    /// Returns the breaker for `name` if it exists.
    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.read().get(name).cloned()
    }

    /// Registered breaker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of one breaker.
    pub fn status(&self, name: &str) -> Option<BreakerStatus> {
        self.get(name).map(|b| b.status())
    }

    /// Status of every breaker, keyed by name.
    pub fn all_status(&self) -> BTreeMap<String, BreakerStatus> {
        self.snapshot()
            .into_iter()
            .map(|b| (b.name().to_string(), b.status()))
            .collect()
    }

    /// Breaker counts by state.
    pub fn counts(&self) -> BreakerCounts {
        let mut counts = BreakerCounts::default();
        for breaker in self.snapshot() {
            counts.total += 1;
            match breaker.current_state() {
                State::Closed => counts.closed += 1,
                State::Open => counts.open += 1,
                State::HalfOpen => counts.half_open += 1,
            }
        }
        counts
    }

    /// Resets one breaker; returns `false` if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Resets every breaker.
    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
        info!("all circuit breakers reset");
    }

    // Clones out of the map so breaker locks and hooks never run under the registry lock.
    fn snapshot(&self) -> Vec<CircuitBreaker> {
        self.breakers.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_once_and_keeps_first_config() {
        let registry = CircuitBreakerRegistry::default();
        let custom = BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        };
        let first = registry.get_or_create("primary", Some(&custom));
        let second = registry.get_or_create("primary", None);
        assert_eq!(first.config().failure_threshold, 2);
        assert_eq!(second.config().failure_threshold, 2);
        assert_eq!(registry.names(), vec!["primary".to_string()]);
    }

    #[test]
    fn reset_of_unknown_breaker_is_reported() {
        let registry = CircuitBreakerRegistry::default();
        assert!(!registry.reset("missing"));
        registry.breaker("known");
        assert!(registry.reset("known"));
        assert_eq!(registry.counts().closed, 1);
    }
}

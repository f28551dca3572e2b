//! Configuration for breakers, retriers, metrics and alerting.
//!
//! Every struct deserializes with `#[serde(default)]`, so a TOML document only
//! needs to name the options it changes:
//!
//! ```toml
//! [breaker]
//! failure_threshold = 3
//!
//! [[dependencies]]
//! name = "primary"
//! retry = { max_attempts = 4, jitter = "equal", retry_budget_enabled = true }
//!
//! [[alerts.rules]]
//! name = "slow_calls"
//! metric = "invoker_request_duration"
//! condition = ">"
//! threshold = 30.0
//! level = "warning"
//! cooldown_sec = 180
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alert::AlertRule;
use crate::breaker::CircuitBreaker;
use crate::error::ConfigError;
use crate::hook::HookRegistry;
use crate::policy::{BreakerPolicy, ConsecutivePolicy};
use crate::retry::RetryConfig;

/// Converts user-supplied seconds into a `Duration` without panicking.
pub(crate) fn duration_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

pub(crate) fn ensure(ok: bool, field: &str, reason: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, reason))
    }
}

/// Circuit breaker options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before admitting a probe.
    pub recovery_timeout_sec: u64,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Upper bound for a single protected call, in seconds.
    pub call_timeout_sec: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_sec: 60,
            success_threshold: 3,
            call_timeout_sec: 30.0,
        }
    }
}

impl BreakerConfig {
    /// Recovery timeout as a `Duration`.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_sec)
    }

    /// Call timeout as a `Duration`.
    pub fn call_timeout(&self) -> Duration {
        duration_from_secs(self.call_timeout_sec)
    }

    /// Checks value ranges, prefixing field names with `path`.
    pub fn validate(&self, path: &str) -> Result<(), ConfigError> {
        ensure(
            self.failure_threshold >= 1,
            &format!("{path}.failure_threshold"),
            "must be at least 1",
        )?;
        ensure(
            self.success_threshold >= 1,
            &format!("{path}.success_threshold"),
            "must be at least 1",
        )?;
        ensure(
            self.call_timeout_sec.is_finite() && self.call_timeout_sec > 0.0,
            &format!("{path}.call_timeout_sec"),
            "must be a positive number of seconds",
        )
    }
}

/// Options for one protected dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyConfig {
    /// Dependency name, also used as the breaker name.
    pub name: String,
    /// Breaker guarding the dependency.
    pub breaker: BreakerConfig,
    /// Retry behaviour inside the breaker.
    pub retry: RetryConfig,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl DependencyConfig {
    /// Creates a dependency with default breaker and retry options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Replaces the breaker options.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replaces the retry options.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(!self.name.is_empty(), "dependencies.name", "must not be empty")?;
        let path = format!("dependencies.{}", self.name);
        self.breaker.validate(&format!("{path}.breaker"))?;
        self.retry.validate(&format!("{path}.retry"))
    }
}

/// Metrics registry options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples kept per metric before the oldest is evicted.
    pub capacity: usize,
    /// Register the built-in metric catalogue at start-up.
    pub register_defaults: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            register_defaults: true,
        }
    }
}

/// Alert engine options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertEngineConfig {
    /// Seconds between rule evaluations.
    pub evaluation_interval_sec: u64,
    /// Alerts kept in history before the oldest is evicted.
    pub history_capacity: usize,
    /// Install the built-in rules before `rules`.
    pub default_rules: bool,
    /// Additional rules.
    pub rules: Vec<AlertRule>,
}

impl Default for AlertEngineConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_sec: 10,
            history_capacity: 1000,
            default_rules: true,
            rules: Vec::new(),
        }
    }
}

impl AlertEngineConfig {
    /// Evaluation interval as a `Duration`.
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_sec)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultToleranceConfig {
    /// Breaker options for breakers created on first use.
    pub breaker: BreakerConfig,
    /// Retry options for dependencies created on first use.
    pub retry: RetryConfig,
    /// Metrics registry options.
    pub metrics: MetricsConfig,
    /// Alert engine options.
    pub alerts: AlertEngineConfig,
    /// Dependencies known up front.
    pub dependencies: Vec<DependencyConfig>,
}

impl FaultToleranceConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every value range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker.validate("breaker")?;
        self.retry.validate("retry")?;
        ensure(
            self.metrics.capacity >= 1,
            "metrics.capacity",
            "must be at least 1",
        )?;
        ensure(
            self.alerts.evaluation_interval_sec >= 1,
            "alerts.evaluation_interval_sec",
            "must be at least 1",
        )?;
        ensure(
            self.alerts.history_capacity >= 1,
            "alerts.history_capacity",
            "must be at least 1",
        )?;
        for rule in &self.alerts.rules {
            rule.validate()?;
        }
        for dependency in &self.dependencies {
            dependency.validate()?;
        }
        Ok(())
    }

    /// Options for `name`, falling back to the top-level defaults.
    pub fn dependency(&self, name: &str) -> DependencyConfig {
        self.dependencies
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .unwrap_or_else(|| DependencyConfig {
                name: name.to_string(),
                breaker: self.breaker.clone(),
                retry: self.retry.clone(),
            })
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder {
    name: String,
    config: BreakerConfig,
    policy: Option<Arc<dyn BreakerPolicy>>,
    hooks: Arc<HookRegistry>,
}

impl BreakerBuilder {
    /// Creates a new builder with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            policy: None,
            hooks: Arc::new(HookRegistry::new()),
        }
    }

    /// Replaces every option at once.
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of consecutive failures required to trip the circuit.
    pub fn failure_threshold(mut self, count: u32) -> Self {
        self.config.failure_threshold = count;
        self
    }

    /// Sets the number of consecutive half-open successes required to close the circuit.
    pub fn success_threshold(mut self, count: u32) -> Self {
        self.config.success_threshold = count;
        self
    }

    /// Sets how long the circuit stays open before admitting a probe.
    pub fn recovery_timeout_sec(mut self, secs: u64) -> Self {
        self.config.recovery_timeout_sec = secs;
        self
    }

    /// Sets the per-call timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_sec = timeout.as_secs_f64();
        self
    }

    /// Sets a custom trip/reset policy.
    pub fn policy<P: BreakerPolicy>(mut self, policy: P) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Sets a hook registry, usually shared between breakers.
    pub fn hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Builds a new circuit breaker with the configured settings.
    pub fn build(self) -> CircuitBreaker {
        let policy = self.policy.unwrap_or_else(|| {
            Arc::new(ConsecutivePolicy::new(
                u64::from(self.config.failure_threshold),
                u64::from(self.config.success_threshold),
            ))
        });
        CircuitBreaker::new(self.name, self.config, policy, self.hooks)
    }
}

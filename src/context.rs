//! The shared resilience context: breakers, metrics and alerting.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::alert::{Alert, AlertEngine, AlertLevel, AlertRule, AlertStats};
use crate::breaker::BreakerStatus;
use crate::config::FaultToleranceConfig;
use crate::error::ConfigError;
use crate::hook::HookRegistry;
use crate::invoker::Invoker;
use crate::metrics::{
    labels, Labels, MetricSummary, MetricsRegistry, CIRCUIT_BREAKERS_OPEN, CIRCUIT_BREAKER_STATE,
};
use crate::state::State;
use crate::registry::{BreakerCounts, CircuitBreakerRegistry};

struct ResilienceInner {
    config: FaultToleranceConfig,
    breakers: CircuitBreakerRegistry,
    metrics: Arc<MetricsRegistry>,
    alerts: Arc<AlertEngine>,
}

/// Process-wide fault tolerance state, built once and passed to every [`Invoker`].
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Resilience {
    inner: Arc<ResilienceInner>,
}

/// Overview of every component.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    /// Breakers per state.
    pub breakers: BreakerCounts,
    /// Alert history counters.
    pub alerts: AlertStats,
    /// Registered metrics.
    pub metrics: usize,
    /// Whether the alert evaluation loop is running.
    pub alert_engine_running: bool,
}

impl Default for Resilience {
    fn default() -> Self {
        Self::build(FaultToleranceConfig::default())
    }
}

impl Resilience {
    /// Creates a context with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `config` and creates a context from it.
    pub fn from_config(config: FaultToleranceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: FaultToleranceConfig) -> Self {
        let metrics = Arc::new(if config.metrics.register_defaults {
            MetricsRegistry::with_defaults(config.metrics.capacity)
        } else {
            MetricsRegistry::with_capacity(config.metrics.capacity)
        });
        let alerts = Arc::new(AlertEngine::new(Arc::clone(&metrics), &config.alerts));

        let hooks = Arc::new(HookRegistry::new());
        let gauge = Arc::clone(&metrics);
        let open = Mutex::new(AHashSet::<String>::new());
        hooks.add_transition_listener(move |name, _from, to| {
            gauge.record(CIRCUIT_BREAKER_STATE, to.as_gauge(), labels([("breaker", name)]));

            // Recorded under the set's lock so concurrent transitions land in order.
            let mut open = open.lock();
            if to == State::Open {
                open.insert(name.to_string());
            } else {
                open.remove(name);
            }
            gauge.record(CIRCUIT_BREAKERS_OPEN, open.len() as f64, Labels::new());
        });
        let breakers = CircuitBreakerRegistry::with_hooks(config.breaker.clone(), hooks);

        info!(
            dependencies = config.dependencies.len(),
            rules = alerts.rules().len(),
            "resilience context initialized"
        );

        Self {
            inner: Arc::new(ResilienceInner {
                config,
                breakers,
                metrics,
                alerts,
            }),
        }
    }

    /// Options this context was built from.
    pub fn config(&self) -> &FaultToleranceConfig {
        &self.inner.config
    }

    /// The breaker registry.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    /// Hooks attached to every breaker.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        self.inner.breakers.hooks()
    }

    /// The metrics registry.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    /// The alert engine.
    pub fn alert_engine(&self) -> &Arc<AlertEngine> {
        &self.inner.alerts
    }

    /// Creates an invoker sharing this context.
    pub fn invoker(&self) -> Invoker {
        Invoker::new(self.clone())
    }

    /// Status of one breaker.
    pub fn breaker_status(&self, name: &str) -> Option<BreakerStatus> {
        self.inner.breakers.status(name)
    }

    /// Status of every breaker.
    pub fn all_breaker_status(&self) -> BTreeMap<String, BreakerStatus> {
        self.inner.breakers.all_status()
    }

    /// Resets one breaker; returns `false` if unknown.
    pub fn reset_breaker(&self, name: &str) -> bool {
        self.inner.breakers.reset(name)
    }

    /// Resets every breaker.
    pub fn reset_all(&self) {
        self.inner.breakers.reset_all();
    }

    /// Records a metric value; returns `false` if the metric is not registered.
    pub fn record_metric(&self, name: &str, value: f64, labels: Labels) -> bool {
        self.inner.metrics.record(name, value, labels)
    }

    /// Latest value and five-minute aggregates of every metric.
    pub fn metrics_summary(&self) -> BTreeMap<String, MetricSummary> {
        self.inner.metrics.summary()
    }

    /// Alerts matching the filters, most recent first.
    pub fn alerts(
        &self,
        level: Option<AlertLevel>,
        resolved: Option<bool>,
        limit: usize,
    ) -> Vec<Alert> {
        self.inner.alerts.alerts(level, resolved, limit)
    }

    /// Marks an alert resolved.
    pub fn resolve_alert(&self, id: &str) -> bool {
        self.inner.alerts.resolve(id)
    }

    /// Installs or replaces an alert rule.
    pub fn add_alert_rule(&self, rule: AlertRule) -> Result<(), ConfigError> {
        rule.validate()?;
        self.inner.alerts.add_rule(rule);
        Ok(())
    }

    /// Removes an alert rule.
    pub fn remove_alert_rule(&self, name: &str) -> bool {
        self.inner.alerts.remove_rule(name)
    }

    /// Raises an ad-hoc alert.
    pub fn trigger_alert(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        level: AlertLevel,
        source: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Alert {
        self.inner
            .alerts
            .trigger_custom(title, message, level, source, metadata)
    }

    /// Starts background alert evaluation.
    pub fn start(&self) -> bool {
        self.inner.alerts.start()
    }

    /// Stops background alert evaluation.
    pub async fn shutdown(&self) {
        self.inner.alerts.stop().await;
        info!("resilience context shut down");
    }

    /// Overview of breakers, alerts and metrics.
    pub fn stats(&self) -> SystemStats {
        SystemStats {
            breakers: self.inner.breakers.counts(),
            alerts: self.inner.alerts.stats(),
            metrics: self.inner.metrics.len(),
            alert_engine_running: self.inner.alerts.is_running(),
        }
    }
}

impl std::fmt::Debug for Resilience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resilience")
            .field("breakers", &self.inner.breakers.names())
            .field("metrics", &self.inner.metrics.len())
            .field("alerts", &self.inner.alerts)
            .finish()
    }
}

//! Threshold rules over metrics and the engine that evaluates them.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ensure, AlertEngineConfig};
use crate::error::ConfigError;
use crate::metrics::{MetricsRegistry, CIRCUIT_BREAKERS_OPEN, INVOKER_REQUEST_DURATION};

// Tolerance for `==` and `!=` on floating-point samples.
const EQ_EPSILON: f64 = 0.001;

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Something is broken.
    Error,
    /// Service is degraded or down.
    Critical,
}

impl AlertLevel {
    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison between a metric value and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// `value > threshold`
    #[serde(rename = ">")]
    Gt,
    /// `value >= threshold`
    #[serde(rename = ">=")]
    Ge,
    /// `value < threshold`
    #[serde(rename = "<")]
    Lt,
    /// `value <= threshold`
    #[serde(rename = "<=")]
    Le,
    /// `|value - threshold| < 0.001`
    #[serde(rename = "==")]
    Eq,
    /// `|value - threshold| >= 0.001`
    #[serde(rename = "!=")]
    Ne,
}

impl Condition {
    /// Applies the comparison.
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Condition::Gt => value > threshold,
            Condition::Ge => value >= threshold,
            Condition::Lt => value < threshold,
            Condition::Le => value <= threshold,
            Condition::Eq => (value - threshold).abs() < EQ_EPSILON,
            Condition::Ne => (value - threshold).abs() >= EQ_EPSILON,
        }
    }

    /// Operator symbol.
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::Gt => ">",
            Condition::Ge => ">=",
            Condition::Lt => "<",
            Condition::Le => "<=",
            Condition::Eq => "==",
            Condition::Ne => "!=",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Condition {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" => Ok(Condition::Gt),
            ">=" => Ok(Condition::Ge),
            "<" => Ok(Condition::Lt),
            "<=" => Ok(Condition::Le),
            "==" => Ok(Condition::Eq),
            "!=" => Ok(Condition::Ne),
            other => Err(ConfigError::invalid(
                "condition",
                format!("unknown operator `{other}`"),
            )),
        }
    }
}

fn default_cooldown_sec() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// A threshold condition on the latest value of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule name.
    pub name: String,
    /// Metric whose latest value is tested.
    #[serde(rename = "metric", alias = "metric_name")]
    pub metric_name: String,
    /// Comparison operator.
    pub condition: Condition,
    /// Threshold compared against.
    pub threshold: f64,
    /// Level of the alerts this rule raises.
    pub level: AlertLevel,
    /// Minimum seconds between two alerts of this rule.
    #[serde(default = "default_cooldown_sec")]
    pub cooldown_sec: u64,
    /// Text included in the alert message.
    #[serde(default)]
    pub description: String,
    /// Disabled rules are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AlertRule {
    /// Creates an enabled rule with the default cooldown.
    pub fn new(
        name: impl Into<String>,
        metric_name: impl Into<String>,
        condition: Condition,
        threshold: f64,
        level: AlertLevel,
    ) -> Self {
        Self {
            name: name.into(),
            metric_name: metric_name.into(),
            condition,
            threshold,
            level,
            cooldown_sec: default_cooldown_sec(),
            description: String::new(),
            enabled: true,
        }
    }

    /// Sets the cooldown.
    pub fn with_cooldown_sec(mut self, secs: u64) -> Self {
        self.cooldown_sec = secs;
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Enables or disables the rule.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Cooldown as a `Duration`.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_sec)
    }

    /// Built-in rules: slow invocations and an open breaker.
    ///
    /// The breaker rule watches the open-breaker count rather than the
    /// per-breaker state gauge, whose latest sample belongs to whichever
    /// breaker moved last.
    pub fn defaults() -> Vec<AlertRule> {
        vec![
            AlertRule::new(
                "high_response_time",
                INVOKER_REQUEST_DURATION,
                Condition::Gt,
                30.0,
                AlertLevel::Warning,
            )
            .with_cooldown_sec(180)
            .with_description("Invocation response time too high"),
            AlertRule::new(
                "circuit_breaker_open",
                CIRCUIT_BREAKERS_OPEN,
                Condition::Gt,
                0.0,
                AlertLevel::Critical,
            )
            .with_cooldown_sec(60)
            .with_description("Circuit breaker is open"),
        ]
    }

    /// Checks the rule is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(!self.name.is_empty(), "alerts.rules.name", "must not be empty")?;
        ensure(
            !self.metric_name.is_empty(),
            &format!("alerts.rules.{}.metric", self.name),
            "must not be empty",
        )?;
        ensure(
            self.threshold.is_finite(),
            &format!("alerts.rules.{}.threshold", self.name),
            "must be finite",
        )
    }
}

/// A raised alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Unique identifier.
    pub id: String,
    /// Severity.
    pub level: AlertLevel,
    /// Short title.
    pub title: String,
    /// Human-readable details.
    pub message: String,
    /// Origin, e.g. `metric:<name>` or `invoker:<dependency>`.
    pub source: String,
    /// When the alert was raised.
    pub timestamp: SystemTime,
    /// Whether it has been resolved.
    pub resolved: bool,
    /// When it was resolved.
    pub resolved_at: Option<SystemTime>,
    /// Extra key/value context.
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    /// Creates an unresolved alert stamped with the current time.
    pub fn new(
        level: AlertLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            level,
            title: title.into(),
            message: message.into(),
            source: source.into(),
            timestamp: SystemTime::now(),
            resolved: false,
            resolved_at: None,
            metadata,
        }
    }
}

/// Alert history counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    /// Alerts in history.
    pub total: usize,
    /// Resolved alerts.
    pub resolved: usize,
    /// Unresolved alerts.
    pub unresolved: usize,
    /// Alerts per level.
    pub by_level: BTreeMap<AlertLevel, usize>,
    /// Installed rules.
    pub rules: usize,
    /// Enabled rules.
    pub enabled_rules: usize,
}

type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync + 'static>;

struct EvaluationTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Evaluates [`AlertRule`]s against a [`MetricsRegistry`] and keeps alert history.
///
/// Evaluation runs on a background task between [`start`](Self::start) and
/// [`stop`](Self::stop); [`evaluate_rules`](Self::evaluate_rules) runs one
/// pass on demand.
pub struct AlertEngine {
    metrics: Arc<MetricsRegistry>,
    rules: RwLock<Vec<AlertRule>>,
    last_triggered: Mutex<AHashMap<String, Instant>>,
    history: Mutex<VecDeque<Alert>>,
    history_capacity: usize,
    callbacks: RwLock<Vec<AlertCallback>>,
    interval: Duration,
    task: Mutex<Option<EvaluationTask>>,
}

impl AlertEngine {
    /// Creates an engine reading from `metrics`.
    pub fn new(metrics: Arc<MetricsRegistry>, config: &AlertEngineConfig) -> Self {
        let engine = Self {
            metrics,
            rules: RwLock::new(Vec::new()),
            last_triggered: Mutex::new(AHashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_capacity: config.history_capacity.max(1),
            callbacks: RwLock::new(Vec::new()),
            interval: config.evaluation_interval().max(Duration::from_millis(1)),
            task: Mutex::new(None),
        };
        if config.default_rules {
            for rule in AlertRule::defaults() {
                engine.add_rule(rule);
            }
        }
        for rule in &config.rules {
            engine.add_rule(rule.clone());
        }
        engine
    }

    /// Time between background evaluations.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Installs a rule, replacing any rule with the same name.
    pub fn add_rule(&self, rule: AlertRule) {
        info!(rule = %rule.name, metric = %rule.metric_name, "added alert rule");
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    /// Removes a rule and its cooldown record; returns whether it existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let removed = {
            let mut rules = self.rules.write();
            let before = rules.len();
            rules.retain(|r| r.name != name);
            rules.len() != before
        };
        self.last_triggered.lock().remove(name);
        if removed {
            info!(rule = name, "removed alert rule");
        }
        removed
    }

    /// Installed rules.
    pub fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().clone()
    }

    /// Registers a callback run for every raised alert.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Runs one evaluation pass and returns the alerts it raised.
    pub fn evaluate_rules(&self) -> Vec<Alert> {
        let rules = self.rules();
        let mut raised = Vec::new();

        for rule in rules.iter().filter(|r| r.enabled) {
            let Some(sample) = self.metrics.latest_sample(&rule.metric_name) else {
                continue;
            };
            if !rule.condition.evaluate(sample.value, rule.threshold) {
                continue;
            }
            if !self.claim_cooldown(rule) {
                continue;
            }

            let metadata = BTreeMap::from([
                ("rule_name".to_string(), rule.name.clone()),
                ("metric_name".to_string(), rule.metric_name.clone()),
                ("metric_value".to_string(), sample.value.to_string()),
                ("condition".to_string(), rule.condition.to_string()),
                ("threshold".to_string(), rule.threshold.to_string()),
            ]);
            let alert = Alert::new(
                rule.level,
                format!("Alert: {}", rule.name),
                format!(
                    "{}. Current value: {}, threshold: {}",
                    rule.description, sample.value, rule.threshold
                ),
                format!("metric:{}", rule.metric_name),
                metadata,
            );
            self.trigger(alert.clone());
            raised.push(alert);
        }

        raised
    }

    // Checks and stamps the cooldown in one step so concurrent passes fire once.
    fn claim_cooldown(&self, rule: &AlertRule) -> bool {
        let now = Instant::now();
        let mut last = self.last_triggered.lock();
        if let Some(at) = last.get(&rule.name) {
            if now.saturating_duration_since(*at) < rule.cooldown() {
                return false;
            }
        }
        last.insert(rule.name.clone(), now);
        true
    }

    /// Records an alert and runs every callback.
    pub fn trigger(&self, alert: Alert) {
        {
            let mut history = self.history.lock();
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        warn!(
            id = %alert.id,
            level = %alert.level,
            source = %alert.source,
            title = %alert.title,
            "{}",
            alert.message
        );

        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&alert))).is_err() {
                error!(id = %alert.id, "alert callback panicked");
            }
        }
    }

    /// Raises an alert outside of rule evaluation.
    pub fn trigger_custom(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        level: AlertLevel,
        source: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Alert {
        let alert = Alert::new(level, title, message, source, metadata);
        self.trigger(alert.clone());
        alert
    }

    /// Marks an alert resolved; returns `false` if unknown or already resolved.
    pub fn resolve(&self, id: &str) -> bool {
        let mut history = self.history.lock();
        match history.iter_mut().find(|a| a.id == id && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(SystemTime::now());
                info!(id, "alert resolved");
                true
            }
            None => false,
        }
    }

    /// Alerts matching the filters, most recent first.
    pub fn alerts(
        &self,
        level: Option<AlertLevel>,
        resolved: Option<bool>,
        limit: usize,
    ) -> Vec<Alert> {
        self.history
            .lock()
            .iter()
            .rev()
            .filter(|a| level.map_or(true, |l| a.level == l))
            .filter(|a| resolved.map_or(true, |r| a.resolved == r))
            .take(limit)
            .cloned()
            .collect()
    }

    /// History and rule counters.
    pub fn stats(&self) -> AlertStats {
        let mut stats = AlertStats::default();
        for alert in self.history.lock().iter() {
            stats.total += 1;
            if alert.resolved {
                stats.resolved += 1;
            } else {
                stats.unresolved += 1;
            }
            *stats.by_level.entry(alert.level).or_insert(0) += 1;
        }
        let rules = self.rules.read();
        stats.rules = rules.len();
        stats.enabled_rules = rules.iter().filter(|r| r.enabled).count();
        stats
    }

    /// Spawns the evaluation loop on the current tokio runtime.
    ///
    /// Returns `false` if already running or called outside a runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("alert engine started outside a tokio runtime");
            return false;
        };

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let engine = Arc::downgrade(self);
        let interval = self.interval;

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        engine.evaluate_rules();
                    }
                }
            }
            debug!("alert evaluation loop stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "alert engine started");
        *task = Some(EvaluationTask { cancel, handle });
        true
    }

    /// Stops the evaluation loop and waits for it to exit.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(err) = task.handle.await {
                error!(%err, "alert evaluation task failed");
            }
            info!("alert engine stopped");
        }
    }

    /// Whether the evaluation loop is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }
}

impl Drop for AlertEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

impl fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEngine")
            .field("rules", &self.rules.read().len())
            .field("alerts", &self.history.lock().len())
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_use_tolerance_for_equality() {
        assert!(Condition::Eq.evaluate(1.0005, 1.0));
        assert!(!Condition::Ne.evaluate(1.0005, 1.0));
        assert!(Condition::Ne.evaluate(1.01, 1.0));
        assert!(Condition::Ge.evaluate(2.0, 2.0));
        assert!(!Condition::Gt.evaluate(2.0, 2.0));
    }

    #[test]
    fn conditions_parse_from_operators() {
        assert_eq!("<=".parse::<Condition>().ok(), Some(Condition::Le));
        assert!("=>".parse::<Condition>().is_err());
    }

    #[test]
    fn adding_a_rule_twice_replaces_it() {
        let engine = AlertEngine::new(
            Arc::new(MetricsRegistry::new()),
            &AlertEngineConfig {
                default_rules: false,
                ..AlertEngineConfig::default()
            },
        );
        engine.add_rule(AlertRule::new("r", "m", Condition::Gt, 1.0, AlertLevel::Info));
        engine.add_rule(AlertRule::new("r", "m", Condition::Gt, 5.0, AlertLevel::Error));
        let rules = engine.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].threshold, 5.0);
    }
}

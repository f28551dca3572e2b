//! Bounded in-memory time series with windowed aggregates.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Samples kept per metric unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Window used by [`MetricsRegistry::summary`].
pub const SUMMARY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Invocations started, labelled by dependency.
pub const INVOKER_REQUESTS_TOTAL: &str = "invoker_requests_total";
/// Seconds spent per invocation, labelled by dependency and outcome.
pub const INVOKER_REQUEST_DURATION: &str = "invoker_request_duration";
/// Failed invocations, labelled by dependency and error.
pub const INVOKER_ERRORS_TOTAL: &str = "invoker_errors_total";
/// Invocations served by the fallback path.
pub const INVOKER_FALLBACKS_TOTAL: &str = "invoker_fallbacks_total";
/// Retries scheduled by a retrier.
pub const RETRY_ATTEMPTS_TOTAL: &str = "retry_attempts_total";
/// Retriers that gave up.
pub const RETRY_GIVEUPS_TOTAL: &str = "retry_giveups_total";
/// Breaker state gauge (closed 0, open 1, half-open 2).
pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";
/// Number of breakers currently open.
pub const CIRCUIT_BREAKERS_OPEN: &str = "circuit_breakers_open";
/// Failures observed by breakers.
pub const CIRCUIT_BREAKER_FAILURES: &str = "circuit_breaker_failures";
/// Share of available dependencies, in percent.
pub const SYSTEM_HEALTH_CHECK: &str = "system_health_check";

/// Kind of a metric. Informational; every kind stores raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Monotonic event count.
    Counter,
    /// Point-in-time value.
    Gauge,
    /// Distribution of observed values.
    Histogram,
    /// Durations in seconds.
    Timer,
}

/// Sample labels, ordered for stable output.
pub type Labels = BTreeMap<String, String>;

/// Builds [`Labels`] from key/value pairs.
pub fn labels<I, K, V>(pairs: I) -> Labels
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// One recorded value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    /// Observed value.
    pub value: f64,
    /// Wall-clock time of the observation.
    pub timestamp: SystemTime,
    /// Labels attached by the recorder.
    pub labels: Labels,
    #[serde(skip)]
    recorded_at: Instant,
}

/// A named metric holding its most recent samples.
#[derive(Debug)]
pub struct Metric {
    name: String,
    kind: MetricType,
    description: String,
    capacity: usize,
    samples: Mutex<VecDeque<MetricSample>>,
}

impl Metric {
    /// Creates an empty metric keeping at most `capacity` samples.
    pub fn new(
        name: impl Into<String>,
        kind: MetricType,
        description: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metric kind.
    pub fn kind(&self) -> MetricType {
        self.kind
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Appends a sample, evicting the oldest past capacity.
    pub fn record(&self, value: f64, labels: Labels) {
        let sample = MetricSample {
            value,
            timestamp: SystemTime::now(),
            labels,
            recorded_at: Instant::now(),
        };
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<MetricSample> {
        self.samples.lock().back().cloned()
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Whether no sample has been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Mean of the samples recorded within `window`.
    pub fn average(&self, window: Duration) -> Option<f64> {
        let values = self.values_within(window);
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Smallest sample recorded within `window`.
    pub fn min(&self, window: Duration) -> Option<f64> {
        self.values_within(window).into_iter().reduce(f64::min)
    }

    /// Largest sample recorded within `window`.
    pub fn max(&self, window: Duration) -> Option<f64> {
        self.values_within(window).into_iter().reduce(f64::max)
    }

    fn values_within(&self, window: Duration) -> Vec<f64> {
        let now = Instant::now();
        let cutoff = now.checked_sub(window);
        self.samples
            .lock()
            .iter()
            .filter(|s| s.recorded_at <= now && cutoff.map_or(true, |c| s.recorded_at >= c))
            .map(|s| s.value)
            .collect()
    }

    fn summary(&self) -> MetricSummary {
        let latest = self.latest();
        MetricSummary {
            kind: self.kind,
            description: self.description.clone(),
            latest_value: latest.as_ref().map(|s| s.value),
            latest_timestamp: latest.map(|s| s.timestamp),
            average_5m: self.average(SUMMARY_WINDOW),
            min_5m: self.min(SUMMARY_WINDOW),
            max_5m: self.max(SUMMARY_WINDOW),
            total_samples: self.len(),
        }
    }
}

/// Per-metric overview returned by [`MetricsRegistry::summary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    /// Metric kind.
    #[serde(rename = "type")]
    pub kind: MetricType,
    /// Description given at registration.
    pub description: String,
    /// Most recent value.
    pub latest_value: Option<f64>,
    /// Time of the most recent value.
    pub latest_timestamp: Option<SystemTime>,
    /// Mean over the last five minutes.
    pub average_5m: Option<f64>,
    /// Minimum over the last five minutes.
    pub min_5m: Option<f64>,
    /// Maximum over the last five minutes.
    pub max_5m: Option<f64>,
    /// Samples currently held.
    pub total_samples: usize,
}

/// Name-keyed collection of metrics.
///
/// Each metric has its own lock; the registry lock only guards the map.
#[derive(Debug)]
pub struct MetricsRegistry {
    metrics: RwLock<AHashMap<String, Arc<Metric>>>,
    capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Creates an empty registry with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty registry keeping `capacity` samples per metric.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            metrics: RwLock::new(AHashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Creates a registry with the built-in metric catalogue.
    pub fn with_defaults(capacity: usize) -> Self {
        let registry = Self::with_capacity(capacity);
        let catalogue = [
            (INVOKER_REQUESTS_TOTAL, MetricType::Counter, "Invocations started"),
            (INVOKER_REQUEST_DURATION, MetricType::Timer, "Invocation duration in seconds"),
            (INVOKER_ERRORS_TOTAL, MetricType::Counter, "Failed invocations"),
            (INVOKER_FALLBACKS_TOTAL, MetricType::Counter, "Invocations served by a fallback"),
            (RETRY_ATTEMPTS_TOTAL, MetricType::Counter, "Retries scheduled"),
            (RETRY_GIVEUPS_TOTAL, MetricType::Counter, "Retry loops that gave up"),
            (CIRCUIT_BREAKER_STATE, MetricType::Gauge, "Breaker state (0 closed, 1 open, 2 half-open)"),
            (CIRCUIT_BREAKERS_OPEN, MetricType::Gauge, "Breakers currently open"),
            (CIRCUIT_BREAKER_FAILURES, MetricType::Counter, "Failures observed by breakers"),
            (SYSTEM_HEALTH_CHECK, MetricType::Gauge, "Available dependencies in percent"),
        ];
        for (name, kind, description) in catalogue {
            registry.register(name, kind, description);
        }
        registry
    }

    /// Samples kept per metric.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers a metric; an existing metric of the same name is kept.
    pub fn register(&self, name: &str, kind: MetricType, description: &str) -> Arc<Metric> {
        if let Some(metric) = self.metrics.read().get(name) {
            return Arc::clone(metric);
        }
        let mut metrics = self.metrics.write();
        let metric = metrics.entry(name.to_string()).or_insert_with(|| {
            debug!(metric = name, ?kind, "registered metric");
            Arc::new(Metric::new(name, kind, description, self.capacity))
        });
        Arc::clone(metric)
    }

    /// Records a value; returns `false` if the metric is not registered.
    pub fn record(&self, name: &str, value: f64, labels: Labels) -> bool {
        match self.get(name) {
            Some(metric) => {
                metric.record(value, labels);
                true
            }
            None => {
                warn!(metric = name, "metric not registered");
                false
            }
        }
    }

    /// Looks up a metric.
    pub fn get(&self, name: &str) -> Option<Arc<Metric>> {
        self.metrics.read().get(name).cloned()
    }

    /// Latest value of a metric.
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.latest_sample(name).map(|s| s.value)
    }

    /// Latest sample of a metric.
    pub fn latest_sample(&self, name: &str) -> Option<MetricSample> {
        self.get(name).and_then(|m| m.latest())
    }

    /// Mean of a metric over `window`; `None` if unknown or no samples.
    pub fn average(&self, name: &str, window: Duration) -> Option<f64> {
        self.get(name).and_then(|m| m.average(window))
    }

    /// Minimum of a metric over `window`.
    pub fn min(&self, name: &str, window: Duration) -> Option<f64> {
        self.get(name).and_then(|m| m.min(window))
    }

    /// Maximum of a metric over `window`.
    pub fn max(&self, name: &str, window: Duration) -> Option<f64> {
        self.get(name).and_then(|m| m.max(window))
    }

    /// Awaits `fut` and records its duration in seconds under `name`.
    pub async fn time<F: Future>(&self, name: &str, labels: Labels, fut: F) -> F::Output {
        let start = Instant::now();
        let output = fut.await;
        self.record(name, start.elapsed().as_secs_f64(), labels);
        output
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered metrics.
    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    /// Whether no metric is registered.
    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    /// Latest value and five-minute aggregates of every metric.
    pub fn summary(&self) -> BTreeMap<String, MetricSummary> {
        let metrics: Vec<Arc<Metric>> = self.metrics.read().values().cloned().collect();
        metrics
            .iter()
            .map(|m| (m.name().to_string(), m.summary()))
            .collect()
    }
}

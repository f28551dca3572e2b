//! Breaker-guarded, retried invocation of named dependencies with fallback.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::alert::AlertLevel;
use crate::breaker::CircuitBreaker;
use crate::budget::RetryBudgetStats;
use crate::config::DependencyConfig;
use crate::context::Resilience;
use crate::error::{Classify, ConfigError, InvokeError, RetryError};
use crate::metrics::{
    labels, Labels, CIRCUIT_BREAKER_FAILURES, INVOKER_ERRORS_TOTAL, INVOKER_FALLBACKS_TOTAL,
    INVOKER_REQUESTS_TOTAL, INVOKER_REQUEST_DURATION, RETRY_ATTEMPTS_TOTAL, RETRY_GIVEUPS_TOTAL,
    SYSTEM_HEALTH_CHECK,
};
use crate::retry::Retrier;
use crate::state::State;

const HEALTHY_SCORE: f64 = 0.8;
const DEGRADED_SCORE: f64 = 0.5;

/// One protected dependency: its breaker and the retrier running inside it.
#[derive(Debug)]
pub struct Dependency {
    config: DependencyConfig,
    breaker: CircuitBreaker,
    retrier: Retrier,
}

impl Dependency {
    /// Dependency name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Options the dependency was created with.
    pub fn config(&self) -> &DependencyConfig {
        &self.config
    }

    /// The guarding breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The retrier.
    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    /// Retry budget counters, if the retrier has a budget.
    pub fn budget_stats(&self) -> Option<RetryBudgetStats> {
        self.retrier.budget_stats()
    }
}

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    /// At least 80% of dependencies available.
    Healthy,
    /// At least 50% available.
    Degraded,
    /// Less than half available.
    Unhealthy,
}

/// Health of one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    /// Breaker state.
    pub state: State,
    /// Whether calls are currently admitted.
    pub available: bool,
    /// Breaker success rate.
    pub success_rate: f64,
    /// Retry budget counters, if any.
    pub retry_budget: Option<RetryBudgetStats>,
}

/// Result of [`Invoker::health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall classification.
    pub status: HealthLevel,
    /// Share of available dependencies, `1.0` without dependencies.
    pub score: f64,
    /// Per-dependency details.
    pub dependencies: BTreeMap<String, DependencyHealth>,
}

/// Runs units of work against named dependencies.
///
/// Each call goes through the dependency's breaker, which wraps its retrier;
/// outcomes are recorded in the context's metrics. Cloning is cheap.
#[derive(Clone)]
pub struct Invoker {
    ctx: Resilience,
    dependencies: Arc<RwLock<AHashMap<String, Arc<Dependency>>>>,
}

impl Invoker {
    /// Creates an invoker with the dependencies declared in the context config.
    pub fn new(ctx: Resilience) -> Self {
        let invoker = Self {
            ctx,
            dependencies: Arc::new(RwLock::new(AHashMap::new())),
        };
        for config in invoker.ctx.config().dependencies.clone() {
            let dependency = invoker.build_dependency(config);
            invoker
                .dependencies
                .write()
                .insert(dependency.name().to_string(), dependency);
        }
        invoker
    }

    /// The shared context.
    pub fn context(&self) -> &Resilience {
        &self.ctx
    }

    /// Adds or replaces a dependency.
    ///
    /// A breaker that already exists under this name keeps its original options.
    pub fn register(&self, config: DependencyConfig) -> Result<Arc<Dependency>, ConfigError> {
        config.validate()?;
        let dependency = self.build_dependency(config);
        self.dependencies
            .write()
            .insert(dependency.name().to_string(), Arc::clone(&dependency));
        Ok(dependency)
    }

    /// Returns the dependency for `name`, creating it from the context config if absent.
    pub fn dependency(&self, name: &str) -> Arc<Dependency> {
        if let Some(dependency) = self.dependencies.read().get(name) {
            return Arc::clone(dependency);
        }
        let mut dependencies = self.dependencies.write();
        let dependency = dependencies
            .entry(name.to_string())
            .or_insert_with(|| self.build_dependency(self.ctx.config().dependency(name)));
        Arc::clone(dependency)
    }

    /// Names of known dependencies, sorted.
    pub fn dependency_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dependencies.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn build_dependency(&self, config: DependencyConfig) -> Arc<Dependency> {
        let breaker = self
            .ctx
            .breakers()
            .get_or_create(&config.name, Some(&config.breaker));

        let on_retry_metrics = Arc::clone(self.ctx.metrics());
        let on_giveup_metrics = Arc::clone(self.ctx.metrics());
        let retry_name = config.name.clone();
        let giveup_name = config.name.clone();

        let retrier = Retrier::new(config.retry.clone())
            .on_retry(move |attempt, _delay| {
                on_retry_metrics.record(
                    RETRY_ATTEMPTS_TOTAL,
                    1.0,
                    labels([
                        ("dependency", retry_name.as_str()),
                        ("kind", attempt.kind.as_str()),
                    ]),
                );
            })
            .on_giveup(move |last, history| {
                warn!(
                    dependency = %giveup_name,
                    attempts = history.len(),
                    kind = last.kind.as_str(),
                    error = %last.error,
                    "retries gave up"
                );
                on_giveup_metrics.record(
                    RETRY_GIVEUPS_TOTAL,
                    1.0,
                    labels([("dependency", giveup_name.as_str())]),
                );
            });

        info!(
            dependency = %config.name,
            budget = config.retry.retry_budget_enabled,
            "dependency registered"
        );
        Arc::new(Dependency {
            config,
            breaker,
            retrier,
        })
    }

    /// Runs `op` against `dependency`.
    pub async fn invoke<F, Fut, T, E>(&self, dependency: &str, op: F) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.invoke_with_cancel(dependency, &CancellationToken::new(), op)
            .await
    }

    /// Runs `op` against `dependency`, aborting once `cancel` fires.
    pub async fn invoke_with_cancel<F, Fut, T, E>(
        &self,
        dependency: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let dependency = self.dependency(dependency);
        self.run(&dependency, cancel, op).await
    }

    /// Runs `op` against `primary`, then `fallback_op` against `fallback` if the
    /// primary breaker is open, timed out or ran out of retries.
    pub async fn invoke_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        primary: &str,
        op: F,
        fallback: &str,
        fallback_op: G,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnMut() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        self.invoke_with_fallback_and_cancel(
            primary,
            op,
            fallback,
            fallback_op,
            &CancellationToken::new(),
        )
        .await
    }

    /// [`invoke_with_fallback`](Self::invoke_with_fallback) with cancellation.
    pub async fn invoke_with_fallback_and_cancel<F, Fut, G, GFut, T, E>(
        &self,
        primary: &str,
        op: F,
        fallback: &str,
        fallback_op: G,
        cancel: &CancellationToken,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnMut() -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let primary = self.dependency(primary);
        let primary_err = match self.run(&primary, cancel, op).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !primary_err.triggers_fallback() || cancel.is_cancelled() {
            return Err(primary_err);
        }

        let fallback = self.dependency(fallback);
        warn!(
            primary = primary.name(),
            fallback = fallback.name(),
            error = %primary_err,
            "primary dependency failed, using fallback"
        );
        self.ctx.metrics().record(
            INVOKER_FALLBACKS_TOTAL,
            1.0,
            labels([("primary", primary.name()), ("fallback", fallback.name())]),
        );

        let fallback_err = match self.run(&fallback, cancel, fallback_op).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if matches!(fallback_err, InvokeError::Cancelled) {
            return Err(fallback_err);
        }

        error!(
            primary = primary.name(),
            fallback = fallback.name(),
            primary_error = %primary_err,
            fallback_error = %fallback_err,
            "primary and fallback dependencies failed"
        );
        let metadata = BTreeMap::from([
            ("primary".to_string(), primary.name().to_string()),
            ("fallback".to_string(), fallback.name().to_string()),
            ("primary_error".to_string(), primary_err.to_string()),
            ("fallback_error".to_string(), fallback_err.to_string()),
        ]);
        self.ctx.trigger_alert(
            "Fallback exhausted",
            format!(
                "'{}' and its fallback '{}' both failed",
                primary.name(),
                fallback.name()
            ),
            AlertLevel::Critical,
            format!("invoker:{}", primary.name()),
            metadata,
        );

        Err(InvokeError::FallbackExhausted {
            primary: Box::new(primary_err),
            fallback: Box::new(fallback_err),
        })
    }

    async fn run<F, Fut, T, E>(
        &self,
        dependency: &Dependency,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, InvokeError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let metrics = self.ctx.metrics();
        let name = dependency.name();
        metrics.record(INVOKER_REQUESTS_TOTAL, 1.0, labels([("dependency", name)]));

        let start = Instant::now();
        let result: Result<T, InvokeError<E>> = dependency
            .breaker
            .call_filtered(
                || dependency.retrier.execute_with_cancel(cancel, op),
                |err| !matches!(err, RetryError::Cancelled),
            )
            .await
            .map_err(InvokeError::from);

        let outcome = match &result {
            Ok(_) => "success",
            Err(err) => err.label(),
        };
        metrics.record(
            INVOKER_REQUEST_DURATION,
            start.elapsed().as_secs_f64(),
            labels([("dependency", name), ("outcome", outcome)]),
        );
        if let Err(err) = &result {
            metrics.record(
                INVOKER_ERRORS_TOTAL,
                1.0,
                labels([("dependency", name), ("error", err.label())]),
            );
            if err.counts_as_breaker_failure() {
                metrics.record(
                    CIRCUIT_BREAKER_FAILURES,
                    1.0,
                    labels([("breaker", dependency.breaker.name())]),
                );
            }
        }
        result
    }

    /// Availability of every known dependency.
    ///
    /// The score is also recorded, in percent, as `system_health_check`.
    pub fn health(&self) -> HealthReport {
        let dependencies: Vec<Arc<Dependency>> =
            self.dependencies.read().values().cloned().collect();

        let report: BTreeMap<String, DependencyHealth> = dependencies
            .iter()
            .map(|d| {
                let status = d.breaker.status();
                let health = DependencyHealth {
                    state: status.state,
                    available: status.state != State::Open,
                    success_rate: status.success_rate,
                    retry_budget: d.budget_stats(),
                };
                (d.name().to_string(), health)
            })
            .collect();

        let score = if report.is_empty() {
            1.0
        } else {
            report.values().filter(|h| h.available).count() as f64 / report.len() as f64
        };
        let status = if score >= HEALTHY_SCORE {
            HealthLevel::Healthy
        } else if score >= DEGRADED_SCORE {
            HealthLevel::Degraded
        } else {
            HealthLevel::Unhealthy
        };

        self.ctx
            .metrics()
            .record(SYSTEM_HEALTH_CHECK, score * 100.0, Labels::new());

        HealthReport {
            status,
            score,
            dependencies: report,
        }
    }

    /// Retry budget counters per dependency that has a budget.
    pub fn retry_budget_stats(&self) -> BTreeMap<String, RetryBudgetStats> {
        self.dependencies
            .read()
            .values()
            .filter_map(|d| d.budget_stats().map(|s| (d.name().to_string(), s)))
            .collect()
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("dependencies", &self.dependency_names())
            .finish()
    }
}

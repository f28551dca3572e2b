//! # faultguard-rs
//!
//! A fault-tolerant invocation layer for calls to unreliable remote
//! dependencies: circuit breakers, retries with backoff, jitter and a shared
//! retry budget, a windowed metrics store and a cooldown-aware alert engine,
//! composed by an [`Invoker`] with primary/fallback paths.
//!
//! ## How a call flows
//!
//! ```text
//! Invoker::invoke(dependency, op)
//!   -> CircuitBreaker gate (fails fast while open, bounds the call by a timeout)
//!     -> Retrier loop (backoff + jitter, consults the RetryBudget)
//!       -> op()
//!   -> outcome and duration recorded in the MetricsRegistry
//! AlertEngine (background task) -> evaluates rules over the metrics
//! ```
//!
//! Circuit breakers move between three states:
//!
//! - **Closed**: Normal operation. Calls pass through to the protected resource.
//! - **Open**: Calls are immediately rejected without attempting to reach the resource.
//! - **Half-Open**: After the recovery timeout, a limited number of probe calls are
//!   permitted to check if the underlying resource has recovered.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use faultguard_rs::{Classify, ErrorKind, InvokeError, Resilience};
//! use std::fmt;
//!
//! #[derive(Debug)]
//! struct ServiceError(String);
//!
//! impl fmt::Display for ServiceError {
//!     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
//!         write!(f, "service error: {}", self.0)
//!     }
//! }
//!
//! impl Classify for ServiceError {
//!     fn kind(&self) -> ErrorKind {
//!         ErrorKind::Unavailable
//!     }
//! }
//!
//! # async fn run() {
//! let ctx = Resilience::new();
//! let invoker = ctx.invoker();
//!
//! let result = invoker
//!     .invoke_with_fallback(
//!         "primary",
//!         || async { Err::<String, _>(ServiceError("down".into())) },
//!         "backup",
//!         || async { Ok("from backup".to_string()) },
//!     )
//!     .await;
//!
//! match result {
//!     Ok(body) => println!("got {body}"),
//!     Err(InvokeError::FallbackExhausted { .. }) => println!("both paths failed"),
//!     Err(err) => println!("call failed: {err}"),
//! }
//! # }
//! ```
//!
//! ## Features
//!
//! - `prometheus` - Prometheus text exposition via `prometheus-client`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod alert;
mod breaker;
mod budget;
mod config;
mod context;
mod error;
mod hook;
mod invoker;
pub mod metrics;
mod policy;
pub mod prelude;
#[cfg(feature = "prometheus")]
#[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
pub mod prometheus;
mod registry;
mod retry;
mod state;
mod stats;

// Re-exports
pub use alert::{Alert, AlertEngine, AlertLevel, AlertRule, AlertStats, Condition};
pub use breaker::{BreakerStatus, CircuitBreaker};
pub use budget::{RetryBudget, RetryBudgetStats};
pub use config::{
    AlertEngineConfig, BreakerBuilder, BreakerConfig, DependencyConfig, FaultToleranceConfig,
    MetricsConfig,
};
pub use context::{Resilience, SystemStats};
pub use error::{
    BreakerError, BreakerResult, Classify, ConfigError, ErrorKind, InvokeError, RetryError,
};
pub use hook::HookRegistry;
pub use invoker::{Dependency, DependencyHealth, HealthLevel, HealthReport, Invoker};
pub use metrics::{Labels, Metric, MetricSample, MetricSummary, MetricType, MetricsRegistry};
pub use policy::{BreakerPolicy, ConsecutivePolicy, FailureRatePolicy};
pub use registry::{BreakerCounts, CircuitBreakerRegistry};
pub use retry::{BackoffStrategy, Jitter, Retrier, RetryAttempt, RetryConfig};
pub use state::{State, StateChange};
pub use stats::BreakerStats;

//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use faultguard_rs::prelude::*;
//!
//! let ctx = Resilience::new();
//! let breaker = ctx.breakers().breaker("search");
//! assert_eq!(breaker.current_state(), State::Closed);
//! ```

pub use crate::alert::{AlertLevel, AlertRule, Condition};
pub use crate::breaker::CircuitBreaker;
pub use crate::config::{BreakerConfig, DependencyConfig, FaultToleranceConfig};
pub use crate::context::Resilience;
pub use crate::error::{BreakerError, Classify, ErrorKind, InvokeError, RetryError};
pub use crate::invoker::Invoker;
pub use crate::metrics::{labels, MetricType};
pub use crate::retry::{BackoffStrategy, Jitter, Retrier, RetryConfig};
pub use crate::state::State;

//! Error types and failure classification.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryAttempt;

/// Result type for circuit breaker operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Coarse classification of a failure, used by retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The remote side did not answer in time.
    Timeout,
    /// Connection could not be established or was dropped.
    Connection,
    /// The remote side asked us to slow down.
    RateLimited,
    /// The remote side is temporarily unavailable.
    Unavailable,
    /// Generic server-side failure.
    Server,
    /// The request itself is malformed; repeating it will not help.
    InvalidRequest,
    /// Credentials were rejected.
    Unauthorized,
    /// Anything else.
    Other,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Timeout,
        ErrorKind::Connection,
        ErrorKind::RateLimited,
        ErrorKind::Unavailable,
        ErrorKind::Server,
        ErrorKind::InvalidRequest,
        ErrorKind::Unauthorized,
        ErrorKind::Other,
    ];

    /// Whether a failure of this kind usually clears up on its own.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::RateLimited
                | ErrorKind::Unavailable
                | ErrorKind::Server
        )
    }

    /// Stable label used in metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Server => "server",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Other => "other",
        }
    }
}

/// Implemented by error types of protected units of work.
pub trait Classify {
    /// Returns the kind of this failure.
    fn kind(&self) -> ErrorKind;
}

impl Classify for io::Error {
    fn kind(&self) -> ErrorKind {
        match io::Error::kind(self) {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::Connection,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorKind::InvalidRequest,
            io::ErrorKind::PermissionDenied => ErrorKind::Unauthorized,
            _ => ErrorKind::Other,
        }
    }
}

/// Error type for circuit breaker operations.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open, calls are not permitted.
    #[error("circuit breaker '{name}' is open, next attempt in {retry_after:?}")]
    Open {
        /// Breaker name.
        name: String,
        /// Time left until the breaker admits a probe.
        retry_after: Duration,
    },

    /// The call did not finish within the breaker's call timeout.
    #[error("circuit breaker '{name}' timed out after {timeout:?}")]
    Timeout {
        /// Breaker name.
        name: String,
        /// The configured call timeout.
        timeout: Duration,
    },

    /// The underlying operation failed.
    #[error("operation error: {0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// Returns the operation error, if this is one.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Error returned by [`Retrier::execute`](crate::Retrier::execute).
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every permitted attempt failed.
    #[error("retries exhausted after {} attempt(s): {last_error}", .attempts.len())]
    Exhausted {
        /// The error of the final attempt.
        last_error: E,
        /// History of every failed attempt.
        attempts: Vec<RetryAttempt>,
    },

    /// The shared retry budget refused another attempt.
    #[error("retry budget exhausted after {} attempt(s): {last_error}", .attempts.len())]
    BudgetExhausted {
        /// The error of the final attempt.
        last_error: E,
        /// History of every failed attempt.
        attempts: Vec<RetryAttempt>,
    },

    /// The failure kind is not eligible for retry.
    #[error("non-retryable failure: {error}")]
    NonRetryable {
        /// The error that stopped the retry loop.
        error: E,
        /// History of every failed attempt.
        attempts: Vec<RetryAttempt>,
    },

    /// The caller cancelled before the work completed.
    #[error("retry loop cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Attempt history, empty for cancellations.
    pub fn attempts(&self) -> &[RetryAttempt] {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::BudgetExhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. } => attempts,
            RetryError::Cancelled => &[],
        }
    }

    /// The last underlying error, if any attempt ran.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last_error, .. }
            | RetryError::BudgetExhausted { last_error, .. } => Some(last_error),
            RetryError::NonRetryable { error, .. } => Some(error),
            RetryError::Cancelled => None,
        }
    }
}

/// Error returned by the [`Invoker`](crate::Invoker).
#[derive(Debug, Error)]
pub enum InvokeError<E> {
    /// The dependency's breaker rejected the call without running it.
    #[error("circuit breaker '{name}' is open, next attempt in {retry_after:?}")]
    CircuitOpen {
        /// Breaker name.
        name: String,
        /// Time left until the breaker admits a probe.
        retry_after: Duration,
    },

    /// The call exceeded the breaker's call timeout.
    #[error("call through '{name}' timed out after {timeout:?}")]
    CircuitTimeout {
        /// Breaker name.
        name: String,
        /// The configured call timeout.
        timeout: Duration,
    },

    /// Every permitted attempt failed.
    #[error("retries exhausted after {} attempt(s): {last_error}", .attempts.len())]
    RetryExhausted {
        /// The error of the final attempt.
        last_error: E,
        /// History of every failed attempt.
        attempts: Vec<RetryAttempt>,
    },

    /// The retry budget refused another attempt.
    #[error("retry budget exhausted after {} attempt(s): {last_error}", .attempts.len())]
    BudgetExhausted {
        /// The error of the final attempt.
        last_error: E,
        /// History of every failed attempt.
        attempts: Vec<RetryAttempt>,
    },

    /// The failure kind is not eligible for retry.
    #[error("non-retryable failure: {error}")]
    NonRetryable {
        /// The error that stopped the retry loop.
        error: E,
        /// History of every failed attempt.
        attempts: Vec<RetryAttempt>,
    },

    /// The caller cancelled the invocation.
    #[error("invocation cancelled")]
    Cancelled,

    /// Both the primary and the fallback dependency failed.
    #[error(
        "primary and fallback both failed (primary: {}; fallback: {})",
        .primary.label(),
        .fallback.label()
    )]
    FallbackExhausted {
        /// Failure of the primary path.
        primary: Box<InvokeError<E>>,
        /// Failure of the fallback path.
        fallback: Box<InvokeError<E>>,
    },
}

impl<E> InvokeError<E> {
    /// Whether this failure should send the call down the fallback path.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            InvokeError::CircuitOpen { .. }
                | InvokeError::CircuitTimeout { .. }
                | InvokeError::RetryExhausted { .. }
                | InvokeError::BudgetExhausted { .. }
        )
    }

    /// Whether this failure was counted against the dependency's breaker.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            InvokeError::CircuitTimeout { .. }
                | InvokeError::RetryExhausted { .. }
                | InvokeError::BudgetExhausted { .. }
                | InvokeError::NonRetryable { .. }
        )
    }

    /// Whether the breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, InvokeError::CircuitOpen { .. })
    }

    /// Short label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            InvokeError::CircuitOpen { .. } => "circuit_open",
            InvokeError::CircuitTimeout { .. } => "circuit_timeout",
            InvokeError::RetryExhausted { .. } => "retry_exhausted",
            InvokeError::BudgetExhausted { .. } => "budget_exhausted",
            InvokeError::NonRetryable { .. } => "non_retryable",
            InvokeError::Cancelled => "cancelled",
            InvokeError::FallbackExhausted { .. } => "fallback_exhausted",
        }
    }
}

impl<E> From<RetryError<E>> for InvokeError<E> {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted {
                last_error,
                attempts,
            } => InvokeError::RetryExhausted {
                last_error,
                attempts,
            },
            RetryError::BudgetExhausted {
                last_error,
                attempts,
            } => InvokeError::BudgetExhausted {
                last_error,
                attempts,
            },
            RetryError::NonRetryable { error, attempts } => {
                InvokeError::NonRetryable { error, attempts }
            }
            RetryError::Cancelled => InvokeError::Cancelled,
        }
    }
}

impl<E> From<BreakerError<RetryError<E>>> for InvokeError<E> {
    fn from(err: BreakerError<RetryError<E>>) -> Self {
        match err {
            BreakerError::Open { name, retry_after } => {
                InvokeError::CircuitOpen { name, retry_after }
            }
            BreakerError::Timeout { name, timeout } => InvokeError::CircuitTimeout { name, timeout },
            BreakerError::Operation(retry) => retry.into(),
        }
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its permitted range.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending option.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

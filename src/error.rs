//! Error taxonomy for the policy engine.
//!
//! Every call through the pipeline ends in either a success value or exactly
//! one [`ExecuteError`] variant, so callers can tell admission control apart
//! from dependency failure.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Terminal outcome of a rejected or failed call.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    /// The caller exceeded its admission rate.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// No concurrency slot and no room (or no time) in the wait queue.
    #[error("bulkhead rejected the call")]
    BulkheadRejected,

    /// The dependency's circuit is open.
    #[error("circuit open")]
    CircuitOpen,

    /// The operation did not finish before its deadline.
    #[error("operation timed out after {deadline:?}")]
    Timeout { deadline: Duration },

    /// The operation itself failed; the cause is passed through untouched.
    #[error("operation failed: {0}")]
    Operation(#[source] E),
}

impl<E> ExecuteError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecuteError::RateLimited { .. } => ErrorKind::RateLimited,
            ExecuteError::BulkheadRejected => ErrorKind::BulkheadRejected,
            ExecuteError::CircuitOpen => ErrorKind::CircuitOpen,
            ExecuteError::Timeout { .. } => ErrorKind::Timeout,
            ExecuteError::Operation(_) => ErrorKind::Operation,
        }
    }

    /// Whether this outcome says something about dependency health.
    ///
    /// Admission rejections never feed the circuit breaker.
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, ExecuteError::Timeout { .. } | ExecuteError::Operation(_))
    }

    /// Returns the operation's own error, if that is what this is.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            ExecuteError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Label-friendly discriminant of [`ExecuteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    BulkheadRejected,
    CircuitOpen,
    Timeout,
    Operation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BulkheadRejected => "bulkhead_rejected",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Operation => "operation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invalid policy parameter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyConfigError {
    #[error("deadline must be greater than zero")]
    ZeroDeadline,

    #[error("max_concurrent must be greater than zero")]
    ZeroConcurrency,

    #[error("queue wait must be greater than zero when set")]
    ZeroQueueWait,

    #[error("rate limit window must be greater than zero")]
    ZeroWindow,

    #[error("rate limit max must be greater than zero")]
    ZeroRateMax,

    #[error("idle eviction must be at least one window ({window_ms}ms), got {idle_ms}ms")]
    IdleEvictionTooShort { idle_ms: u64, window_ms: u64 },

    #[error("error threshold percentage must be within 1..=100, got {0}")]
    ThresholdOutOfRange(u8),

    #[error("rolling window must cover at least one call or millisecond")]
    ZeroRollingWindow,

    #[error("rolling window of {calls} calls can never exceed minimum_volume {minimum_volume}")]
    WindowBelowMinimumVolume { calls: u32, minimum_volume: u32 },

    #[error("reset timeout must be greater than zero")]
    ZeroResetTimeout,

    #[error("trial timeout must be greater than zero when set")]
    ZeroTrialTimeout,

    #[error("key idle eviction must be greater than zero")]
    ZeroKeyIdleEviction,
}

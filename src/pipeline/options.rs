//! Per-call options and degraded results.

use crate::error::ErrorKind;
use crate::resilience::timeouts::Deadline;

/// Per-call adjustments. Policy configuration itself is never changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Replaces the dependency's configured deadline for this call.
    pub deadline: Option<Deadline>,

    /// Caller identity for rate limiting. Defaults to the dependency key.
    pub rate_limit_key: Option<String>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_rate_limit_key(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_key = Some(key.into());
        self
    }
}

/// Result of a call that may have been served by a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed<T> {
    pub value: T,
    /// Kind of the failure the fallback replaced, if any.
    pub degraded_from: Option<ErrorKind>,
}

impl<T> Completed<T> {
    pub fn is_degraded(&self) -> bool {
        self.degraded_from.is_some()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

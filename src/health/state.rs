//! Service health state.
//!
//! # States
//! - Live: process is running; false only after [`HealthReporter::mark_fatal`]
//! - Ready: every readiness-critical circuit breaker is Closed
//!
//! # State Transitions
//! ```text
//! Live → Not live: mark_fatal (one-way)
//! Ready → Not ready: a critical breaker leaves Closed
//! Not ready → Ready: the last non-Closed critical breaker closes
//! ```
//!
//! # Design Decisions
//! - Readiness is recomputed on every query, O(critical breakers), never
//!   waiting on in-flight calls
//! - A cached flag is also refreshed from breaker transitions for pollers
//!   that want a single atomic load
//! - Ready is stricter than "no critical breaker is Open": Half-Open also
//!   counts as not ready, since recovery is unproven until the trial call
//!   closes the circuit
//! - Only breakers of configured dependencies are registered; keys first
//!   seen at call time never affect readiness
//! - Liveness ignores policy state entirely

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;

use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitState};

/// Answer to a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
}

#[derive(Debug)]
struct ReporterInner {
    live: AtomicBool,
    ready: AtomicBool,
    critical: DashMap<String, Arc<CircuitBreaker>>,
}

impl ReporterInner {
    fn compute_ready(&self) -> bool {
        self.critical
            .iter()
            .all(|entry| entry.value().state() == CircuitState::Closed)
    }

    fn refresh(&self) -> bool {
        let ready = self.compute_ready();
        let was = self.ready.swap(ready, Ordering::AcqRel);
        if was != ready {
            tracing::info!(ready, "Readiness changed");
        }
        ready
    }
}

/// Liveness and readiness for the whole engine.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    inner: Arc<ReporterInner>,
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthReporter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                live: AtomicBool::new(true),
                ready: AtomicBool::new(true),
                critical: DashMap::new(),
            }),
        }
    }

    /// Track `breaker` if it is readiness-critical. Returns whether it was.
    pub fn register(&self, breaker: &Arc<CircuitBreaker>) -> bool {
        if !breaker.is_readiness_critical() {
            return false;
        }
        self.inner
            .critical
            .insert(breaker.key().to_string(), Arc::clone(breaker));

        let reporter: Weak<ReporterInner> = Arc::downgrade(&self.inner);
        breaker.subscribe(move |_| {
            if let Some(reporter) = reporter.upgrade() {
                reporter.refresh();
            }
        });

        self.inner.refresh();
        true
    }

    /// Current status, with readiness recomputed from breaker state.
    pub fn get_health(&self) -> HealthStatus {
        HealthStatus {
            live: self.is_live(),
            ready: self.inner.refresh(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Readiness as of the last breaker transition or query.
    pub fn cached_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Record an unrecoverable failure. Liveness never comes back.
    pub fn mark_fatal(&self, reason: &str) {
        if self.inner.live.swap(false, Ordering::AcqRel) {
            tracing::error!(reason, "Marked not live");
        }
    }

    /// Keys of the readiness-critical breakers.
    pub fn critical_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .critical
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

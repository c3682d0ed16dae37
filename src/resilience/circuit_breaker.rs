//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through and are recorded
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a single trial call probes for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure ratio >= threshold, with enough volume in the window
//! Open → Half-Open: first call attempted after reset_timeout (lazy, no timer)
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails (opened_at restarts)
//! ```
//!
//! # Design Decisions
//! - One breaker per dependency key, shared by all callers of that key
//! - Fail fast in Open state (no waiting for timeout)
//! - Single trial in Half-Open; concurrent callers are rejected, not queued
//! - Every transition bumps a generation; outcomes of calls admitted under an
//!   older generation are dropped instead of polluting the new state
//! - Observers run after the state lock is released, behind a panic boundary

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::schema::CircuitBreakerConfig;
use crate::error::PolicyConfigError;
use crate::observability::metrics;
use crate::resilience::window::{OutcomeWindow, WindowTotals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call rejected because the circuit is open (or a trial is already running).
#[derive(Debug, Clone, Error)]
#[error("circuit '{key}' is {state}")]
pub struct CircuitOpenError {
    pub key: String,
    pub state: CircuitState,
}

/// Published on every state change.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    pub key: String,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Window contents at the moment of the transition.
    pub totals: WindowTotals,
}

pub type TransitionObserver = Arc<dyn Fn(&TransitionEvent) + Send + Sync>;

/// Point-in-time view for health and admin reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub successes: u64,
    pub failures: u64,
    pub failure_percentage: f64,
    /// Milliseconds since the circuit last opened, while not Closed.
    pub open_for_ms: Option<u64>,
    pub trial_in_flight: bool,
    pub readiness_critical: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: OutcomeWindow,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    generation: u64,
}

impl BreakerInner {
    fn transition(&mut self, key: &str, to: CircuitState, now: Instant) -> TransitionEvent {
        let from = self.state;
        let totals = self.window.totals(now);
        self.state = to;
        self.generation += 1;
        self.trial_in_flight = false;
        match to {
            CircuitState::Open => self.opened_at = Some(now),
            CircuitState::Closed => {
                self.opened_at = None;
                self.window.clear();
            }
            CircuitState::HalfOpen => {}
        }
        TransitionEvent {
            key: key.to_string(),
            from,
            to,
            totals,
        }
    }

    fn reset_elapsed(&self, reset_timeout: Duration, now: Instant) -> bool {
        self.opened_at
            .map_or(true, |at| now.saturating_duration_since(at) >= reset_timeout)
    }
}

/// Per-dependency circuit breaker.
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    observers: RwLock<Vec<TransitionObserver>>,
    export_state: bool,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        key: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<Self>, PolicyConfigError> {
        config.validate()?;
        Ok(Self::build(key.into(), config, true))
    }

    fn build(key: String, config: CircuitBreakerConfig, export_state: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: OutcomeWindow::new(config.rolling_window),
                opened_at: None,
                trial_in_flight: false,
                generation: 0,
            }),
            config,
            observers: RwLock::new(Vec::new()),
            export_state,
        })
    }

    /// A new Closed breaker for `key` with this breaker's configuration.
    /// Observers are not carried over, and its state is not exported as a
    /// per-key gauge.
    pub fn fresh_for(&self, key: impl Into<String>) -> Arc<Self> {
        Self::build(key.into(), self.config.clone(), false)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn is_readiness_critical(&self) -> bool {
        self.config.readiness_critical
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. Never transitions.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call attempted now would certainly be rejected.
    ///
    /// Read-only: an Open circuit whose reset timeout has elapsed reports
    /// `false` here and only moves to Half-Open in [`try_acquire`].
    ///
    /// [`try_acquire`]: CircuitBreaker::try_acquire
    pub fn would_reject(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => !inner.reset_elapsed(self.config.reset_timeout(), Instant::now()),
            CircuitState::HalfOpen => inner.trial_in_flight,
        }
    }

    /// Ask permission for one call.
    ///
    /// The returned permit must be settled with `record_success` or
    /// `record_failure`. Dropping it unsettled releases a trial slot without
    /// touching statistics.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, CircuitOpenError> {
        let now = Instant::now();
        let mut event = None;

        let result = {
            let mut inner = self.lock();
            let state = inner.state;
            match state {
                CircuitState::Closed => Ok(self.permit(inner.generation, false)),
                CircuitState::Open if inner.reset_elapsed(self.config.reset_timeout(), now) => {
                    event = Some(inner.transition(&self.key, CircuitState::HalfOpen, now));
                    inner.trial_in_flight = true;
                    Ok(self.permit(inner.generation, true))
                }
                CircuitState::HalfOpen if !inner.trial_in_flight => {
                    inner.trial_in_flight = true;
                    Ok(self.permit(inner.generation, true))
                }
                state => Err(CircuitOpenError {
                    key: self.key.clone(),
                    state,
                }),
            }
        };

        if let Some(event) = event {
            self.publish(event);
        }
        result
    }

    fn permit(self: &Arc<Self>, generation: u64, trial: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: Arc::clone(self),
            generation,
            trial,
            settled: false,
        }
    }

    fn complete(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let event = {
            let mut inner = self.lock();
            if inner.generation != generation {
                tracing::trace!(key = %self.key, "Dropping outcome from a previous circuit state");
                return;
            }
            let state = inner.state;
            match state {
                CircuitState::Closed => {
                    inner.window.record(success, now);
                    if success {
                        None
                    } else {
                        let totals = inner.window.totals(now);
                        self.should_trip(totals)
                            .then(|| inner.transition(&self.key, CircuitState::Open, now))
                    }
                }
                CircuitState::HalfOpen if success => {
                    Some(inner.transition(&self.key, CircuitState::Closed, now))
                }
                CircuitState::HalfOpen => Some(inner.transition(&self.key, CircuitState::Open, now)),
                CircuitState::Open => None,
            }
        };

        if let Some(event) = event {
            self.publish(event);
        }
    }

    fn abandon(&self, generation: u64, trial: bool) {
        if !trial {
            return;
        }
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// A failure trips the circuit only when `minimum_volume` outcomes were
    /// already in the window before it landed.
    fn should_trip(&self, totals: WindowTotals) -> bool {
        let total = totals.total();
        total > u64::from(self.config.minimum_volume)
            && totals.failures * 100 >= u64::from(self.config.error_threshold_percentage) * total
    }

    /// Force the circuit Closed and clear its statistics.
    pub fn reset(&self) {
        let event = {
            let mut inner = self.lock();
            if inner.state == CircuitState::Closed {
                inner.window.clear();
                None
            } else {
                Some(inner.transition(&self.key, CircuitState::Closed, Instant::now()))
            }
        };
        if let Some(event) = event {
            self.publish(event);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        let totals = inner.window.totals(now);
        BreakerSnapshot {
            key: self.key.clone(),
            state: inner.state,
            successes: totals.successes,
            failures: totals.failures,
            failure_percentage: totals.failure_percentage(),
            open_for_ms: inner
                .opened_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            trial_in_flight: inner.trial_in_flight,
            readiness_critical: self.config.readiness_critical,
        }
    }

    /// Register an observer fired synchronously on every transition.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&TransitionEvent) + Send + Sync + 'static,
    {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    fn publish(&self, event: TransitionEvent) {
        match event.to {
            CircuitState::Open => tracing::warn!(
                key = %event.key,
                from = %event.from,
                failures = event.totals.failures,
                calls = event.totals.total(),
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(key = %event.key, "Circuit breaker half-open, allowing trial call")
            }
            CircuitState::Closed => {
                tracing::info!(key = %event.key, from = %event.from, "Circuit breaker closed")
            }
        }
        if self.export_state {
            metrics::record_breaker_state(&event.key, event.to);
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                tracing::error!(key = %event.key, to = %event.to, "Transition observer panicked");
            }
        }
    }
}

/// Permission for one call through a [`CircuitBreaker`].
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this is the Half-Open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.complete(self.generation, true);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.complete(self.generation, false);
    }

    pub fn record(self, success: bool) {
        if success {
            self.record_success();
        } else {
            self.record_failure();
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.generation, self.trial);
        }
    }
}

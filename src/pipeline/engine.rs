//! The execution pipeline.
//!
//! # Responsibilities
//! - Run one operation through every policy configured for its key
//! - Return exactly one tagged outcome per call
//! - Feed the outcome back to the circuit breaker
//!
//! # Design Decisions
//! - Fixed order: rate limiter → bulkhead → circuit breaker → timeout
//! - A read-only breaker pre-check runs first, so a call the breaker is
//!   certain to reject costs no rate-limit token and no bulkhead slot
//! - The bulkhead permit travels with the operation future and is released
//!   only when the operation stops, even if the caller already timed out
//! - Admission rejections never reach breaker statistics
//! - No retries

use std::sync::Arc;

use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::loader::ConfigError;
use crate::config::schema::{EngineConfig, ExpiryMode};
use crate::config::validation::validate_config;
use crate::error::ExecuteError;
use crate::health::{HealthReporter, HealthStatus};
use crate::observability::metrics;
use crate::pipeline::options::{CallOptions, Completed};
use crate::pipeline::registry::{KeyPolicies, PolicyRegistry};
use crate::resilience::bulkhead::BulkheadStats;
use crate::resilience::circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, TransitionEvent,
};
use crate::resilience::operation::Operation;
use crate::resilience::rate_limit::Admission;
use crate::resilience::timeouts::{run_with_deadline, Deadline, DetachedOperations};

#[derive(Debug)]
struct PipelineInner {
    registry: PolicyRegistry,
    health: HealthReporter,
    detached: Arc<DetachedOperations>,
}

/// Entry point for guarded calls. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_health(config, HealthReporter::new())
    }

    /// Build on an existing reporter, e.g. one created before startup so
    /// startup failures can be reported through it.
    pub fn with_health(config: EngineConfig, health: HealthReporter) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let detached = DetachedOperations::new();
        let registry = PolicyRegistry::new(&config, &detached, health.clone())?;

        tracing::info!(
            dependencies = config.dependencies.len(),
            "Policy pipeline ready"
        );

        Ok(Self {
            inner: Arc::new(PipelineInner {
                registry,
                health,
                detached,
            }),
        })
    }

    /// Run `op` under the policies for `key`.
    pub async fn execute<O>(&self, key: &str, op: O) -> Result<O::Output, ExecuteError<O::Error>>
    where
        O: Operation,
    {
        self.execute_with(key, CallOptions::default(), op).await
    }

    /// Run `op` under the policies for `key`, with per-call options.
    pub async fn execute_with<O>(
        &self,
        key: &str,
        options: CallOptions,
        op: O,
    ) -> Result<O::Output, ExecuteError<O::Error>>
    where
        O: Operation,
    {
        self.execute_labeled(key, options, op).await.0
    }

    /// Runs the call and returns its outcome with the metric label in use.
    async fn execute_labeled<O>(
        &self,
        key: &str,
        options: CallOptions,
        op: O,
    ) -> (Result<O::Output, ExecuteError<O::Error>>, Arc<str>)
    where
        O: Operation,
    {
        let policies = self.inner.registry.get_or_create(key);
        let call_id = Uuid::new_v4();
        let span = tracing::debug_span!("execute", key = %key, call_id = %call_id);
        let started = Instant::now();

        let result = run(key, &policies, options, op, &self.inner.detached)
            .instrument(span)
            .await;

        metrics::record_outcome(
            &policies.metric_label,
            result.as_ref().err().map(ExecuteError::kind),
            started.elapsed(),
        );
        (result, Arc::clone(&policies.metric_label))
    }

    /// Like [`execute_with`], but any rejection or failure is handed to
    /// `fallback` to produce a degraded value. The original outcome is logged
    /// and counted first; breaker statistics see only the real outcome.
    ///
    /// [`execute_with`]: Pipeline::execute_with
    pub async fn execute_with_fallback<O, F>(
        &self,
        key: &str,
        options: CallOptions,
        op: O,
        fallback: F,
    ) -> Completed<O::Output>
    where
        O: Operation,
        F: FnOnce(&ExecuteError<O::Error>) -> O::Output,
    {
        match self.execute_labeled(key, options, op).await {
            (Ok(value), _) => Completed {
                value,
                degraded_from: None,
            },
            (Err(error), label) => {
                let kind = error.kind();
                tracing::info!(key = %key, kind = %kind, "Serving fallback value");
                metrics::record_fallback(&label, kind);
                Completed {
                    value: fallback(&error),
                    degraded_from: Some(kind),
                }
            }
        }
    }

    /// Register `callback` for state changes of `key`'s circuit breaker.
    ///
    /// Returns false if the key has no breaker. The callback runs
    /// synchronously on the thread that caused the transition; a panic in it
    /// is caught and logged. A subscribed key is never evicted as idle.
    pub fn on_transition<F>(&self, key: &str, callback: F) -> bool
    where
        F: Fn(&TransitionEvent) + Send + Sync + 'static,
    {
        match &self.inner.registry.pin(key).breaker {
            Some(breaker) => {
                breaker.subscribe(callback);
                true
            }
            None => false,
        }
    }

    pub fn get_health(&self) -> HealthStatus {
        self.inner.health.get_health()
    }

    pub fn health(&self) -> &HealthReporter {
        &self.inner.health
    }

    /// The breaker guarding `key`, if the key is known and has one.
    pub fn breaker(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.registry.get(key).and_then(|p| p.breaker.clone())
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.inner
            .registry
            .breakers()
            .iter()
            .map(|b| b.snapshot())
            .collect()
    }

    pub fn bulkhead_stats(&self, key: &str) -> Option<BulkheadStats> {
        self.inner
            .registry
            .get(key)
            .and_then(|p| p.bulkhead.as_ref().map(|b| b.stats()))
    }

    /// Keys with instantiated policies.
    pub fn keys(&self) -> Vec<String> {
        self.inner.registry.keys()
    }

    /// Timed-out operations still running in the background.
    pub fn detached_in_flight(&self) -> usize {
        self.inner.detached.in_flight()
    }

    /// Forget unconfigured keys idle past `registry.idle_evict_ms` now.
    /// Lookups also do this on their own, at most once per idle period.
    /// Returns keys removed.
    pub fn sweep_idle_keys(&self) -> usize {
        self.inner.registry.sweep_idle()
    }

    /// Drop idle per-caller rate-limit state now. Returns keys removed.
    pub fn sweep_rate_limits(&self) -> usize {
        self.inner
            .registry
            .rate_limiters()
            .iter()
            .map(|limiter| limiter.sweep_idle())
            .sum()
    }
}

async fn run<O>(
    key: &str,
    policies: &KeyPolicies,
    options: CallOptions,
    op: O,
    detached: &Arc<DetachedOperations>,
) -> Result<O::Output, ExecuteError<O::Error>>
where
    O: Operation,
{
    let label = &*policies.metric_label;

    if let Some(breaker) = &policies.breaker {
        if breaker.would_reject() {
            return Err(rejected(key, label, ExecuteError::CircuitOpen));
        }
    }

    if let Some(limiter) = &policies.rate_limiter {
        let caller = options.rate_limit_key.as_deref().unwrap_or(key);
        if let Admission::RateLimited { retry_after } = limiter.try_acquire(caller) {
            return Err(rejected(key, label, ExecuteError::RateLimited { retry_after }));
        }
    }

    let slot = match &policies.bulkhead {
        Some(bulkhead) => match bulkhead.acquire().await {
            Ok(permit) => Some(permit),
            Err(reason) => {
                tracing::debug!(reason = %reason, "Bulkhead rejected call");
                return Err(rejected(key, label, ExecuteError::BulkheadRejected));
            }
        },
        None => None,
    };

    // Re-checked for real: the circuit may have opened while queued.
    let permit = match &policies.breaker {
        Some(breaker) => match breaker.try_acquire() {
            Ok(permit) => Some(permit),
            Err(_) => return Err(rejected(key, label, ExecuteError::CircuitOpen)),
        },
        None => None,
    };

    let deadline = effective_deadline(policies, &options, permit.as_ref());
    let mode = policies
        .timeout
        .as_ref()
        .map_or(ExpiryMode::Cancel, |t| t.mode());

    let fut = op.call();
    let guarded = async move {
        let _slot = slot;
        fut.await
    };

    let result = match deadline {
        Some(deadline) => match run_with_deadline(guarded, deadline, mode, detached).await {
            Ok(outcome) => outcome.map_err(ExecuteError::Operation),
            Err(elapsed) => {
                tracing::debug!(
                    deadline_ms = elapsed.deadline.as_millis() as u64,
                    "Call timed out"
                );
                Err(ExecuteError::Timeout {
                    deadline: elapsed.deadline,
                })
            }
        },
        None => guarded.await.map_err(ExecuteError::Operation),
    };

    if let Some(permit) = permit {
        permit.record(result.is_ok());
    }
    result
}

fn rejected<E>(key: &str, label: &str, error: ExecuteError<E>) -> ExecuteError<E> {
    let kind = error.kind();
    tracing::debug!(key = %key, kind = %kind, "Call rejected");
    metrics::record_rejection(label, kind);
    error
}

/// Per-call override, else the configured deadline. A Half-Open trial is
/// additionally bounded by the breaker's trial timeout.
fn effective_deadline(
    policies: &KeyPolicies,
    options: &CallOptions,
    permit: Option<&BreakerPermit>,
) -> Option<Deadline> {
    let base = options
        .deadline
        .or_else(|| policies.timeout.as_ref().map(|t| t.deadline()));

    let trial = permit
        .filter(|p| p.is_trial())
        .and(policies.breaker.as_ref())
        .and_then(|b| b.config().trial_timeout())
        .and_then(|d| Deadline::new(d).ok());

    match (base, trial) {
        (Some(base), Some(trial)) => Some(base.min(trial)),
        (base, trial) => base.or(trial),
    }
}

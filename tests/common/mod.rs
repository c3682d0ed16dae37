//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_engine::config::{
    BulkheadConfig, CircuitBreakerConfig, EngineConfig, RateLimitConfig, RateLimitStrategy,
    RollingWindow, TimeoutConfig,
};
use resilience_engine::Pipeline;

/// Error returned by the test operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency failed: {0}")]
pub struct DependencyDown(pub &'static str);

pub async fn succeed_after<T>(delay: Duration, value: T) -> Result<T, DependencyDown> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Ok(value)
}

pub async fn fail_after<T>(delay: Duration, reason: &'static str) -> Result<T, DependencyDown> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Err(DependencyDown(reason))
}

/// Counts how many operations actually started.
#[derive(Debug, Clone, Default)]
pub struct Invocations(Arc<AtomicUsize>);

impl Invocations {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn breaker(minimum_volume: u32, reset_timeout_ms: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        error_threshold_percentage: 50,
        minimum_volume,
        rolling_window: RollingWindow::Calls(20),
        reset_timeout_ms,
        trial_timeout_ms: None,
        readiness_critical: true,
    }
}

pub fn bulkhead(max_concurrent: usize, max_queue: usize, queue_wait_ms: Option<u64>) -> BulkheadConfig {
    BulkheadConfig {
        enabled: true,
        max_concurrent,
        max_queue,
        queue_wait_ms,
    }
}

pub fn fixed_rate(max: u32, window_ms: u64) -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        window_ms,
        max,
        strategy: RateLimitStrategy::Fixed,
        idle_evict_ms: None,
    }
}

pub fn timeout(deadline_ms: u64) -> TimeoutConfig {
    TimeoutConfig {
        deadline_ms,
        ..TimeoutConfig::default()
    }
}

/// A pipeline whose defaults are exactly the given sections.
pub fn pipeline(
    timeout: Option<TimeoutConfig>,
    bulkhead: Option<BulkheadConfig>,
    rate_limit: Option<RateLimitConfig>,
    breaker: Option<CircuitBreakerConfig>,
) -> Pipeline {
    let mut config = EngineConfig::default();
    config.defaults.timeout = timeout;
    config.defaults.bulkhead = bulkhead;
    config.defaults.rate_limit = rate_limit;
    config.defaults.circuit_breaker = breaker;
    Pipeline::new(config).unwrap()
}

/// Yield until `condition` holds. Paused time does not advance meanwhile.
pub async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PolicyConfigError;

/// Root configuration for the policy engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Policies applied to any key without its own entry.
    pub defaults: PolicySet,

    /// Per-dependency overrides, keyed by dependency name.
    pub dependencies: HashMap<String, PolicySet>,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Health/admin HTTP surface.
    pub admin: AdminConfig,

    /// Lifetime of policies created for unconfigured keys.
    pub registry: KeyRegistryConfig,

    /// Host shutdown behavior.
    pub lifecycle: LifecycleConfig,
}

impl EngineConfig {
    /// Resolve the effective policy set for a key.
    ///
    /// Sections present in the dependency entry replace the default section
    /// wholesale; absent sections fall back to the defaults.
    pub fn resolve(&self, key: &str) -> ResolvedPolicies {
        self.resolve_overrides(self.dependencies.get(key))
    }

    /// The policies a key without its own entry receives.
    pub fn resolve_defaults(&self) -> ResolvedPolicies {
        self.resolve_overrides(None)
    }

    fn resolve_overrides(&self, overrides: Option<&PolicySet>) -> ResolvedPolicies {
        ResolvedPolicies {
            timeout: overrides
                .and_then(|o| o.timeout.clone())
                .or_else(|| self.defaults.timeout.clone())
                .filter(|c| c.enabled),
            bulkhead: overrides
                .and_then(|o| o.bulkhead.clone())
                .or_else(|| self.defaults.bulkhead.clone())
                .filter(|c| c.enabled),
            rate_limit: overrides
                .and_then(|o| o.rate_limit.clone())
                .or_else(|| self.defaults.rate_limit.clone())
                .filter(|c| c.enabled),
            circuit_breaker: overrides
                .and_then(|o| o.circuit_breaker.clone())
                .or_else(|| self.defaults.circuit_breaker.clone())
                .filter(|c| c.enabled),
            rate_limit_shared: overrides.map_or(true, |o| o.rate_limit.is_none()),
        }
    }
}

/// A set of optional policy sections.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PolicySet {
    pub timeout: Option<TimeoutConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

/// Effective, enabled-only policies for one key.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPolicies {
    pub timeout: Option<TimeoutConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// True when the key uses the default rate limiter rather than its own.
    pub rate_limit_shared: bool,
}

/// What happens to an operation that misses its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryMode {
    /// Drop the operation's future.
    #[default]
    Cancel,
    /// Leave it running on the runtime and track it until it finishes.
    Detach,
}

/// Timeout policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub enabled: bool,

    /// Relative deadline in milliseconds.
    pub deadline_ms: u64,

    pub on_expiry: ExpiryMode,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deadline_ms: 3_000,
            on_expiry: ExpiryMode::Cancel,
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        if self.deadline_ms == 0 {
            return Err(PolicyConfigError::ZeroDeadline);
        }
        Ok(())
    }
}

/// Bulkhead policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BulkheadConfig {
    pub enabled: bool,

    /// Maximum operations executing at once.
    pub max_concurrent: usize,

    /// Maximum callers waiting for a slot. Zero disables queuing.
    pub max_queue: usize,

    /// How long a queued caller waits before being rejected.
    pub queue_wait_ms: Option<u64>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 64,
            max_queue: 128,
            queue_wait_ms: Some(1_000),
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        if self.max_concurrent == 0 {
            return Err(PolicyConfigError::ZeroConcurrency);
        }
        if self.queue_wait_ms == Some(0) {
            return Err(PolicyConfigError::ZeroQueueWait);
        }
        Ok(())
    }

    pub fn queue_wait(&self) -> Option<Duration> {
        self.queue_wait_ms.map(Duration::from_millis)
    }
}

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    Fixed,
    #[default]
    TokenBucket,
}

/// Rate limiter policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Window length in milliseconds.
    pub window_ms: u64,

    /// Admissions per window (also the token bucket capacity).
    pub max: u32,

    pub strategy: RateLimitStrategy,

    /// Idle time after which a key's state is dropped. Defaults to one window.
    pub idle_evict_ms: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 1_000,
            max: 100,
            strategy: RateLimitStrategy::TokenBucket,
            idle_evict_ms: None,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        if self.window_ms == 0 {
            return Err(PolicyConfigError::ZeroWindow);
        }
        if self.max == 0 {
            return Err(PolicyConfigError::ZeroRateMax);
        }
        if let Some(idle_ms) = self.idle_evict_ms {
            // Evicting sooner than a window would forget live counters.
            if idle_ms < self.window_ms {
                return Err(PolicyConfigError::IdleEvictionTooShort {
                    idle_ms,
                    window_ms: self.window_ms,
                });
            }
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn idle_evict(&self) -> Duration {
        Duration::from_millis(self.idle_evict_ms.unwrap_or(self.window_ms))
    }
}

/// Rolling statistic discipline for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollingWindow {
    /// The last N recorded calls.
    Calls(u32),
    /// Calls recorded in the trailing N milliseconds.
    Millis(u64),
}

impl Default for RollingWindow {
    fn default() -> Self {
        RollingWindow::Calls(20)
    }
}

/// Circuit breaker policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,

    /// Failure ratio (percent) at or above which the circuit opens.
    pub error_threshold_percentage: u8,

    /// Outcomes that must already be in the window before a failure can trip it.
    pub minimum_volume: u32,

    pub rolling_window: RollingWindow,

    /// Time spent Open before a trial call is allowed.
    pub reset_timeout_ms: u64,

    /// Deadline applied to HalfOpen trial calls.
    pub trial_timeout_ms: Option<u64>,

    /// Whether an Open circuit makes the service not ready.
    pub readiness_critical: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold_percentage: 50,
            minimum_volume: 10,
            rolling_window: RollingWindow::default(),
            reset_timeout_ms: 30_000,
            trial_timeout_ms: None,
            readiness_critical: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        if !(1..=100).contains(&self.error_threshold_percentage) {
            return Err(PolicyConfigError::ThresholdOutOfRange(
                self.error_threshold_percentage,
            ));
        }
        match self.rolling_window {
            RollingWindow::Calls(0) | RollingWindow::Millis(0) => {
                return Err(PolicyConfigError::ZeroRollingWindow)
            }
            // The trip check needs more than `minimum_volume` outcomes in view.
            RollingWindow::Calls(calls) if calls <= self.minimum_volume => {
                return Err(PolicyConfigError::WindowBelowMinimumVolume {
                    calls,
                    minimum_volume: self.minimum_volume,
                })
            }
            _ => {}
        }
        if self.reset_timeout_ms == 0 {
            return Err(PolicyConfigError::ZeroResetTimeout);
        }
        if self.trial_timeout_ms == Some(0) {
            return Err(PolicyConfigError::ZeroTrialTimeout);
        }
        Ok(())
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn trial_timeout(&self) -> Option<Duration> {
        self.trial_timeout_ms.map(Duration::from_millis)
    }
}

/// Policies stamped from the defaults for keys without a `dependencies`
/// entry. These never count toward readiness.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyRegistryConfig {
    /// Idle time after which an unconfigured key's policies are dropped.
    pub idle_evict_ms: u64,
}

impl Default for KeyRegistryConfig {
    fn default() -> Self {
        Self {
            idle_evict_ms: 300_000,
        }
    }
}

impl KeyRegistryConfig {
    pub fn validate(&self) -> Result<(), PolicyConfigError> {
        if self.idle_evict_ms == 0 {
            return Err(PolicyConfigError::ZeroKeyIdleEviction);
        }
        Ok(())
    }

    pub fn idle_evict(&self) -> Duration {
        Duration::from_millis(self.idle_evict_ms)
    }
}

/// Host lifecycle configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long shutdown waits for detached operations. Zero skips the wait.
    pub drain_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
        }
    }
}

impl LifecycleConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Health and admin endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve the health/admin router.
    pub enabled: bool,

    /// Bind address for the router.
    pub bind_address: String,

    /// Bearer token required on `/admin/*` routes. Health routes stay open.
    pub api_key: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8081".to_string(),
            api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            [defaults.timeout]
            deadline_ms = 250

            [dependencies.payments.circuit_breaker]
            error_threshold_percentage = 25
            rolling_window = { millis = 10000 }

            [dependencies.payments.rate_limit]
            enabled = true
            strategy = "fixed"
            max = 5
            window_ms = 60000
            "#,
        )
        .unwrap();

        assert_eq!(config.defaults.timeout.as_ref().unwrap().deadline_ms, 250);
        let payments = config.dependencies.get("payments").unwrap();
        let cb = payments.circuit_breaker.as_ref().unwrap();
        assert_eq!(cb.rolling_window, RollingWindow::Millis(10_000));
        assert_eq!(cb.minimum_volume, 10);
        assert_eq!(
            payments.rate_limit.as_ref().unwrap().strategy,
            RateLimitStrategy::Fixed
        );
    }

    #[test]
    fn test_resolve_overrides_whole_sections() {
        let mut config = EngineConfig::default();
        config.defaults.timeout = Some(TimeoutConfig::default());
        config.defaults.bulkhead = Some(BulkheadConfig::default());
        config.dependencies.insert(
            "search".into(),
            PolicySet {
                timeout: Some(TimeoutConfig {
                    deadline_ms: 50,
                    ..TimeoutConfig::default()
                }),
                bulkhead: Some(BulkheadConfig {
                    enabled: false,
                    ..BulkheadConfig::default()
                }),
                ..PolicySet::default()
            },
        );

        let search = config.resolve("search");
        assert_eq!(search.timeout.unwrap().deadline_ms, 50);
        assert!(search.bulkhead.is_none());
        assert!(search.rate_limit_shared);

        let other = config.resolve("other");
        assert_eq!(other.timeout.unwrap().deadline_ms, 3_000);
        assert!(other.bulkhead.is_some());
        assert!(other.circuit_breaker.is_none());
    }

    #[test]
    fn test_policy_validation() {
        let timeout = TimeoutConfig { deadline_ms: 0, ..TimeoutConfig::default() };
        assert_eq!(timeout.validate(), Err(PolicyConfigError::ZeroDeadline));

        let cb = CircuitBreakerConfig {
            error_threshold_percentage: 0,
            ..CircuitBreakerConfig::default()
        };
        assert_eq!(cb.validate(), Err(PolicyConfigError::ThresholdOutOfRange(0)));

        let rl = RateLimitConfig {
            idle_evict_ms: Some(10),
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            rl.validate(),
            Err(PolicyConfigError::IdleEvictionTooShort { .. })
        ));
    }

    #[test]
    fn test_count_window_must_outgrow_minimum_volume() {
        let unreachable = CircuitBreakerConfig {
            minimum_volume: 10,
            rolling_window: RollingWindow::Calls(10),
            ..CircuitBreakerConfig::default()
        };
        assert_eq!(
            unreachable.validate(),
            Err(PolicyConfigError::WindowBelowMinimumVolume {
                calls: 10,
                minimum_volume: 10
            })
        );

        let smallest = CircuitBreakerConfig {
            rolling_window: RollingWindow::Calls(11),
            ..unreachable.clone()
        };
        assert!(smallest.validate().is_ok());

        // Time windows hold any number of calls.
        let timed = CircuitBreakerConfig {
            rolling_window: RollingWindow::Millis(10),
            ..unreachable
        };
        assert!(timed.validate().is_ok());
    }

    #[test]
    fn test_key_registry_defaults() {
        let config: EngineConfig = toml::from_str("[registry]\nidle_evict_ms = 60000").unwrap();
        assert_eq!(config.registry.idle_evict(), Duration::from_secs(60));
        assert_eq!(
            KeyRegistryConfig { idle_evict_ms: 0 }.validate(),
            Err(PolicyConfigError::ZeroKeyIdleEviction)
        );
        assert_eq!(EngineConfig::default().registry.idle_evict_ms, 300_000);
    }
}

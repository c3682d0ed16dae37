//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate policy parameters (deadlines > 0, thresholds in range)
//! - Validate bind addresses of the admin and metrics surfaces
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Policy checks reuse each policy config's own `validate`, so the loader
//!   and the policy constructors can never disagree
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{EngineConfig, PolicySet};
use crate::error::PolicyConfigError;

/// One invalid field, addressed by its dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_policy_set("defaults", &config.defaults, &mut errors);

    let mut keys: Vec<&String> = config.dependencies.keys().collect();
    keys.sort();
    for key in keys {
        if key.trim().is_empty() {
            errors.push(ValidationError {
                path: "dependencies".into(),
                message: "dependency key must not be empty".into(),
            });
        }
        validate_policy_set(
            &format!("dependencies.{key}"),
            &config.dependencies[key],
            &mut errors,
        );
    }

    if let Err(e) = config.registry.validate() {
        errors.push(ValidationError {
            path: format!("registry.{}", field_of(&e)),
            message: e.to_string(),
        });
    }

    if config.observability.metrics_enabled {
        check_address(
            "observability.metrics_address",
            &config.observability.metrics_address,
            &mut errors,
        );
    }

    if config.admin.enabled {
        check_address("admin.bind_address", &config.admin.bind_address, &mut errors);
    }
    if matches!(config.admin.api_key.as_deref(), Some(k) if k.is_empty()) {
        errors.push(ValidationError {
            path: "admin.api_key".into(),
            message: "api key must not be empty when set".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_policy_set(prefix: &str, set: &PolicySet, errors: &mut Vec<ValidationError>) {
    if let Some(timeout) = &set.timeout {
        push(errors, prefix, "timeout", timeout.validate());
    }
    if let Some(bulkhead) = &set.bulkhead {
        push(errors, prefix, "bulkhead", bulkhead.validate());
    }
    if let Some(rate_limit) = &set.rate_limit {
        push(errors, prefix, "rate_limit", rate_limit.validate());
    }
    if let Some(breaker) = &set.circuit_breaker {
        push(errors, prefix, "circuit_breaker", breaker.validate());
    }
}

fn push(
    errors: &mut Vec<ValidationError>,
    prefix: &str,
    section: &str,
    result: Result<(), PolicyConfigError>,
) {
    if let Err(e) = result {
        errors.push(ValidationError {
            path: format!("{prefix}.{section}.{}", field_of(&e)),
            message: e.to_string(),
        });
    }
}

fn field_of(error: &PolicyConfigError) -> &'static str {
    match error {
        PolicyConfigError::ZeroDeadline => "deadline_ms",
        PolicyConfigError::ZeroConcurrency => "max_concurrent",
        PolicyConfigError::ZeroQueueWait => "queue_wait_ms",
        PolicyConfigError::ZeroWindow => "window_ms",
        PolicyConfigError::ZeroRateMax => "max",
        PolicyConfigError::IdleEvictionTooShort { .. } => "idle_evict_ms",
        PolicyConfigError::ThresholdOutOfRange(_) => "error_threshold_percentage",
        PolicyConfigError::ZeroRollingWindow => "rolling_window",
        PolicyConfigError::WindowBelowMinimumVolume { .. } => "rolling_window",
        PolicyConfigError::ZeroResetTimeout => "reset_timeout_ms",
        PolicyConfigError::ZeroTrialTimeout => "trial_timeout_ms",
        PolicyConfigError::ZeroKeyIdleEviction => "idle_evict_ms",
    }
}

fn check_address(path: &str, value: &str, errors: &mut Vec<ValidationError>) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError {
            path: path.into(),
            message: format!("invalid socket address '{value}'"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{CircuitBreakerConfig, RollingWindow, TimeoutConfig};

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error_with_paths() {
        let mut config = EngineConfig::default();
        config.defaults.timeout = Some(TimeoutConfig {
            deadline_ms: 0,
            ..TimeoutConfig::default()
        });
        config.dependencies.insert(
            "payments".into(),
            PolicySet {
                timeout: Some(TimeoutConfig {
                    deadline_ms: 0,
                    ..TimeoutConfig::default()
                }),
                circuit_breaker: Some(CircuitBreakerConfig {
                    error_threshold_percentage: 0,
                    ..CircuitBreakerConfig::default()
                }),
                ..PolicySet::default()
            },
        );
        config.admin.bind_address = "not-an-address".into();

        let errors = validate_config(&config).unwrap_err();
        let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "defaults.timeout.deadline_ms",
                "dependencies.payments.timeout.deadline_ms",
                "dependencies.payments.circuit_breaker.error_threshold_percentage",
                "admin.bind_address",
            ]
        );
    }

    #[test]
    fn test_disabled_sections_are_still_checked() {
        let mut config = EngineConfig::default();
        config.defaults.timeout = Some(TimeoutConfig {
            enabled: false,
            deadline_ms: 0,
            ..TimeoutConfig::default()
        });
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_breaker_that_can_never_open_is_rejected() {
        let mut config = EngineConfig::default();
        config.dependencies.insert(
            "payments".into(),
            PolicySet {
                circuit_breaker: Some(CircuitBreakerConfig {
                    minimum_volume: 10,
                    rolling_window: RollingWindow::Calls(10),
                    ..CircuitBreakerConfig::default()
                }),
                ..PolicySet::default()
            },
        );
        config.registry.idle_evict_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "dependencies.payments.circuit_breaker.rolling_window",
                "registry.idle_evict_ms",
            ]
        );
    }

    #[test]
    fn test_metrics_address_only_checked_when_enabled() {
        let mut config = EngineConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].path, "observability.metrics_address");
    }
}

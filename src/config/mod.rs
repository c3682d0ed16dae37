//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → handed to Pipeline::new, which builds the policy registry
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no hot reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - A dependency section replaces the matching default section wholesale

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BulkheadConfig, CircuitBreakerConfig, EngineConfig, ExpiryMode,
    KeyRegistryConfig, LifecycleConfig, ObservabilityConfig, PolicySet, RateLimitConfig, RateLimitStrategy, RollingWindow,
    TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};

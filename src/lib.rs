//! Resilience policy engine.
//!
//! Wraps calls to unreliable dependencies in a fixed chain of policies and
//! reports the aggregate health of the service.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller ── execute(key, op) ──▶ ┌──────────────────────────────────────────┐
//!                                  │ pipeline                                 │
//!                                  │  rate limit → bulkhead → breaker → timeout│──▶ op
//!                                  └───────────────┬──────────────────────────┘
//!                                                  │ transitions
//!                                                  ▼
//!   probes ── get_health() ──────▶ health reporter (live / ready)
//! ```
//!
//! ```no_run
//! use resilience_engine::{EngineConfig, Pipeline};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::new(EngineConfig::default())?;
//! let value = pipeline
//!     .execute("inventory", || async { Ok::<_, std::io::Error>(42) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod resilience;

pub use config::schema::EngineConfig;
pub use error::{ErrorKind, ExecuteError, PolicyConfigError};
pub use health::{HealthReporter, HealthStatus};
pub use lifecycle::{Shutdown, ShutdownReason};
pub use pipeline::{CallOptions, Completed, Pipeline};
pub use resilience::{CircuitState, Deadline, Operation, TransitionEvent};

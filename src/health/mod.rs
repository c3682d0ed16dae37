//! Health reporting subsystem.
//!
//! # Data Flow
//! ```text
//! Circuit breaker transition (resilience/circuit_breaker.rs):
//!     → observer registered by state.rs
//!     → cached readiness refreshed
//!
//! Probe (admin/handlers.rs or library caller):
//!     → HealthReporter::get_health
//!     → readiness recomputed over critical breakers
//! ```
//!
//! # Design Decisions
//! - Liveness and readiness are independent
//! - Only breakers marked readiness-critical affect readiness
//! - Health state is per-process, not per-dependency

pub mod state;

pub use state::{HealthReporter, HealthStatus};

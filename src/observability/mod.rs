//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Policies and pipeline produce:
//!     → logging.rs (structured log events, one span per call)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Call ID flows through every event of a call via the span
//! - Metrics are cheap and optional

pub mod logging;
pub mod metrics;

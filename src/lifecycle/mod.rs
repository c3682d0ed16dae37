//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger(reason)
//!
//! Shutdown (shutdown.rs):
//!     trigger → admin server drains and exits
//!             → detached operations drained, bounded by lifecycle.drain_timeout_ms
//! ```
//!
//! # Design Decisions
//! - The engine itself owns no background tasks; only the host binary
//!   needs coordinated shutdown
//! - Ordered shutdown with a deadline: stop serving, drain, exit
//! - Liveness is cleared through the health reporter on fatal errors, not
//!   on ordinary shutdown

pub mod shutdown;
pub mod signals;

pub use shutdown::{drain_detached, Shutdown, ShutdownReason};

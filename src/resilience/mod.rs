//! Resilience policies.
//!
//! # Data Flow
//! ```text
//! Call admitted by the pipeline:
//!     → rate_limit.rs (per caller key, admission only)
//!     → bulkhead.rs (bounded concurrency + FIFO wait queue)
//!     → circuit_breaker.rs (reject while Open, single trial while Half-Open)
//!     → timeouts.rs (race the operation against its deadline)
//!     → outcome fed back to circuit_breaker.rs (window.rs statistics)
//! ```
//!
//! # Design Decisions
//! - Every policy is usable on its own; the pipeline only composes them
//! - All mutable state sits behind per-instance locks; nothing is global
//! - Window rotation and state transitions are evaluated lazily at call time,
//!   no background tickers
//! - No policy retries; a retry is a fresh call through the pipeline

pub mod bulkhead;
pub mod circuit_breaker;
pub mod operation;
pub mod rate_limit;
pub mod timeouts;
pub mod window;

pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadRejection, BulkheadStats};
pub use circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitOpenError, CircuitState,
    TransitionEvent, TransitionObserver,
};
pub use operation::Operation;
pub use rate_limit::{Admission, RateLimiter};
pub use timeouts::{Deadline, DetachedOperations, Elapsed, TimeoutPolicy};

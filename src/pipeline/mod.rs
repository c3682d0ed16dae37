//! Policy composition.
//!
//! # Data Flow
//! ```text
//! Pipeline::execute(key, op)
//!     → registry.rs (policy instances for key, created on first use,
//!       dropped again once an unconfigured key goes idle)
//!     → breaker pre-check (fail fast, nothing consumed)
//!     → rate limiter → bulkhead → circuit breaker → timeout
//!     → operation
//!     → outcome recorded by the breaker, bulkhead slot released
//!     → Result<T, ExecuteError<E>> (or Completed<T> with a fallback)
//! ```
//!
//! # Design Decisions
//! - One registry entry per dependency key, shared by all callers
//! - No lock spans more than one key
//! - Every stage short-circuits with its own error kind

pub mod engine;
pub mod options;
pub(crate) mod registry;

pub use engine::Pipeline;
pub use options::{CallOptions, Completed};

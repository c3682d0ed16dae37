//! Timeout enforcement.
//!
//! # Responsibilities
//! - Race an operation against a relative deadline
//! - Return promptly at the deadline, never waiting for the operation to stop
//! - Track operations abandoned in detach mode until they really finish
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from operation errors
//! - Cancel mode drops the future at the deadline (Rust's native cancellation)
//! - Detach mode spawns the operation; on expiry it keeps running and is
//!   counted in [`DetachedOperations`]. An operation that never finishes is a
//!   resource leak, surfaced through `in_flight()` and a warning log
//! - Never retries

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::config::schema::{ExpiryMode, TimeoutConfig};
use crate::error::PolicyConfigError;
use crate::observability::metrics;

/// A validated, strictly positive relative deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Duration);

impl Deadline {
    pub fn new(duration: Duration) -> Result<Self, PolicyConfigError> {
        if duration.is_zero() {
            return Err(PolicyConfigError::ZeroDeadline);
        }
        Ok(Self(duration))
    }

    pub fn from_millis(ms: u64) -> Result<Self, PolicyConfigError> {
        Self::new(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

/// The deadline elapsed before the operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline of {deadline:?} elapsed")]
pub struct Elapsed {
    pub deadline: Duration,
}

const RUNNING: u8 = 0;
const ABANDONED: u8 = 1;
const FINISHED: u8 = 2;

/// Counts operations that outlived their caller's deadline.
#[derive(Debug, Default)]
pub struct DetachedOperations {
    in_flight: AtomicUsize,
    total: AtomicU64,
}

impl DetachedOperations {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Abandoned operations still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Operations abandoned since start.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Run `fut` with a deadline.
pub async fn run_with_deadline<F, T>(
    fut: F,
    deadline: Deadline,
    mode: ExpiryMode,
    detached: &Arc<DetachedOperations>,
) -> Result<T, Elapsed>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let limit = deadline.as_duration();
    match mode {
        ExpiryMode::Cancel => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Elapsed { deadline: limit }),
        ExpiryMode::Detach => run_detached(fut, limit, detached).await,
    }
}

async fn run_detached<F, T>(
    fut: F,
    limit: Duration,
    detached: &Arc<DetachedOperations>,
) -> Result<T, Elapsed>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let call_id = Uuid::new_v4();
    let phase = Arc::new(AtomicU8::new(RUNNING));

    let task_phase = Arc::clone(&phase);
    let tracker = Arc::clone(detached);
    let mut handle = tokio::spawn(async move {
        let output = fut.await;
        if task_phase.swap(FINISHED, Ordering::AcqRel) == ABANDONED {
            tracker.in_flight.fetch_sub(1, Ordering::AcqRel);
            metrics::record_detached(tracker.in_flight());
            tracing::info!(call_id = %call_id, "Abandoned operation finished, result discarded");
        }
        output
    });

    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(join_error)) => match join_error.try_into_panic() {
            Ok(payload) => std::panic::resume_unwind(payload),
            // Only reachable if the runtime is shutting down.
            Err(_) => Err(Elapsed { deadline: limit }),
        },
        Err(_) => {
            detached.in_flight.fetch_add(1, Ordering::AcqRel);
            if phase
                .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                detached.total.fetch_add(1, Ordering::Relaxed);
                metrics::record_detached(detached.in_flight());
                tracing::warn!(
                    call_id = %call_id,
                    deadline_ms = limit.as_millis() as u64,
                    in_flight = detached.in_flight(),
                    "Operation abandoned after deadline, still running in background"
                );
            } else {
                // Finished in the instant between expiry and here.
                detached.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Err(Elapsed { deadline: limit })
        }
    }
}

/// Configured timeout for one dependency.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    deadline: Deadline,
    mode: ExpiryMode,
    detached: Arc<DetachedOperations>,
}

impl TimeoutPolicy {
    pub fn new(
        config: &TimeoutConfig,
        detached: Arc<DetachedOperations>,
    ) -> Result<Self, PolicyConfigError> {
        config.validate()?;
        Ok(Self {
            deadline: Deadline::from_millis(config.deadline_ms)?,
            mode: config.on_expiry,
            detached,
        })
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn mode(&self) -> ExpiryMode {
        self.mode
    }

    /// Run with the configured deadline.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Elapsed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_with(fut, self.deadline).await
    }

    /// Run with an explicit deadline in this policy's expiry mode.
    pub async fn run_with<F, T>(&self, fut: F, deadline: Deadline) -> Result<T, Elapsed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        run_with_deadline(fut, deadline, self.mode, &self.detached).await
    }
}

//! Shutdown coordination for the engine host.
//!
//! # Sequence
//! ```text
//! trigger(reason)
//!     → admin server stops accepting, finishes open requests
//!     → drain_detached: wait for timed-out operations still running
//!     → exit, abandoning whatever outlived the drain timeout
//! ```
//!
//! # Design Decisions
//! - The first trigger wins; later ones are logged and ignored
//! - A trigger is sticky: waiting after it fired returns at once
//! - Draining never cancels detached operations, it only waits for them

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::pipeline::Pipeline;

/// Poll interval while draining detached operations.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Why the host is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// Asked for in-process, e.g. by an embedding application.
    Requested,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Interrupt => "interrupt",
            ShutdownReason::Terminate => "terminate",
            ShutdownReason::Requested => "requested",
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-shot, sticky shutdown trigger. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Start shutting down. Returns false if already triggered.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if first {
            tracing::info!(reason = %reason, "Shutdown triggered");
        } else {
            tracing::debug!(reason = %reason, "Shutdown already in progress");
        }
        first
    }

    /// The reason of the winning trigger, if any.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    /// Resolve once shutdown is triggered, immediately if it already was.
    pub async fn triggered(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Wait up to `timeout` for the pipeline's detached operations to finish.
///
/// Returns how many were still running when it stopped waiting.
pub async fn drain_detached(pipeline: &Pipeline, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = pipeline.detached_in_flight();
        if remaining == 0 {
            return 0;
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(remaining, "Drain timeout reached, abandoning detached operations");
            return remaining;
        }
        tracing::debug!(remaining, "Waiting for detached operations");
        tokio::time::sleep(DRAIN_POLL.min(deadline - now)).await;
    }
}

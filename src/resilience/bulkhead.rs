//! Concurrency isolation per dependency.
//!
//! # Responsibilities
//! - Bound the number of in-flight operations (`max_concurrent`)
//! - Queue a bounded number of waiters (`max_queue`) in FIFO order
//! - Reject immediately when the queue is full
//!
//! # Design Decisions
//! - A released slot is handed directly to the oldest waiter under the lock,
//!   so a newer acquirer can never steal it between release and wake-up
//! - Permits are RAII guards; dropping one releases the slot
//! - A waiter that gives up (deadline or cancellation) removes itself; if the
//!   slot was already handed over it passes the slot on

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::schema::BulkheadConfig;
use crate::error::PolicyConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BulkheadRejection {
    #[error("bulkhead queue is full")]
    QueueFull,
    #[error("timed out waiting for a bulkhead slot")]
    QueueTimeout,
}

/// Occupancy counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkheadStats {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    slot: oneshot::Sender<()>,
}

#[derive(Debug)]
struct BulkheadState {
    active: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

#[derive(Debug)]
struct Shared {
    max_concurrent: usize,
    max_queue: usize,
    state: Mutex<BulkheadState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BulkheadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give the slot to the oldest live waiter, or free it.
    fn release(&self) {
        let mut state = self.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.slot.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    /// Remove a waiter still in the queue. False means its slot was already sent.
    fn dequeue(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.waiters.iter().position(|w| w.id == id) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Bounded-concurrency gate for one dependency.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    shared: Arc<Shared>,
    queue_wait: Option<Duration>,
}

impl Bulkhead {
    pub fn new(config: &BulkheadConfig) -> Result<Self, PolicyConfigError> {
        config.validate()?;
        Ok(Self::build(
            config.max_concurrent,
            config.max_queue,
            config.queue_wait(),
        ))
    }

    fn build(max_concurrent: usize, max_queue: usize, queue_wait: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_concurrent,
                max_queue,
                state: Mutex::new(BulkheadState {
                    active: 0,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                }),
            }),
            queue_wait,
        }
    }

    /// A new, empty bulkhead with the same limits.
    ///
    /// Unlike `clone`, the result shares no occupancy with `self`.
    pub fn empty_like(&self) -> Self {
        Self::build(
            self.shared.max_concurrent,
            self.shared.max_queue,
            self.queue_wait,
        )
    }

    /// Acquire a slot, waiting in the queue if there is room.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadRejection> {
        let (id, rx) = {
            let mut state = self.shared.lock();
            if state.active < self.shared.max_concurrent {
                state.active += 1;
                return Ok(self.permit());
            }
            if state.waiters.len() >= self.shared.max_queue {
                return Err(BulkheadRejection::QueueFull);
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, slot: tx });
            (id, rx)
        };

        let mut wait = QueuedWait {
            shared: Arc::clone(&self.shared),
            id,
            slot: rx,
            done: false,
        };

        let handed_over = match self.queue_wait {
            Some(limit) => match tokio::time::timeout(limit, &mut wait.slot).await {
                Ok(received) => received.is_ok(),
                Err(_) => {
                    if self.shared.dequeue(id) {
                        false
                    } else {
                        // Released to us just as the deadline hit.
                        wait.slot.try_recv().is_ok()
                    }
                }
            },
            None => (&mut wait.slot).await.is_ok(),
        };
        wait.done = true;

        if handed_over {
            Ok(self.permit())
        } else {
            tracing::debug!(waiter = id, "Bulkhead wait deadline elapsed");
            Err(BulkheadRejection::QueueTimeout)
        }
    }

    /// Acquire only if a slot is free right now.
    pub fn try_acquire(&self) -> Result<BulkheadPermit, BulkheadRejection> {
        let mut state = self.shared.lock();
        if state.active < self.shared.max_concurrent {
            state.active += 1;
            Ok(self.permit())
        } else {
            Err(BulkheadRejection::QueueFull)
        }
    }

    fn permit(&self) -> BulkheadPermit {
        BulkheadPermit {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stats(&self) -> BulkheadStats {
        let state = self.shared.lock();
        BulkheadStats {
            active: state.active,
            queued: state.waiters.len(),
            max_concurrent: self.shared.max_concurrent,
            max_queue: self.shared.max_queue,
        }
    }
}

/// An occupied bulkhead slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    shared: Arc<Shared>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Cleans up a queued acquire that is cancelled before it settles.
struct QueuedWait {
    shared: Arc<Shared>,
    id: u64,
    slot: oneshot::Receiver<()>,
    done: bool,
}

impl Drop for QueuedWait {
    fn drop(&mut self) {
        if self.done || self.shared.dequeue(self.id) {
            return;
        }
        if self.slot.try_recv().is_ok() {
            self.shared.release();
        }
    }
}

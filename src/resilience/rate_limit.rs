//! Per-key admission rate limiting.
//!
//! # Strategies
//! - Fixed window: a counter per key, reset at each window boundary
//! - Token bucket: `max` tokens per key, refilled continuously at
//!   `max / window`, capped at `max`
//!
//! # Design Decisions
//! - Keyed state lives in a sharded map; callers of different keys rarely
//!   contend and no lock spans more than one shard
//! - Token arithmetic is integer fixed-point (one token = `window` nanoseconds
//!   of refill) so refill boundaries are exact
//! - Idle keys are evicted lazily: once per window, an admission sweeps keys
//!   idle for longer than `idle_evict`. A key idle for a full window would be
//!   back at full capacity anyway, so eviction never changes a decision

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::schema::{RateLimitConfig, RateLimitStrategy};
use crate::error::PolicyConfigError;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    RateLimited { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug)]
enum KeyState {
    Fixed { window_start: Instant, count: u32 },
    Bucket { tokens: u128, last_refill: Instant },
}

#[derive(Debug)]
struct KeyWindow {
    state: KeyState,
    last_seen: Instant,
}

/// Rate limiter shared by every key it sees.
#[derive(Debug)]
pub struct RateLimiter {
    strategy: RateLimitStrategy,
    max: u32,
    window: Duration,
    idle_evict: Duration,
    keys: DashMap<String, KeyWindow>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self, PolicyConfigError> {
        config.validate()?;
        Ok(Self {
            strategy: config.strategy,
            max: config.max,
            window: config.window(),
            idle_evict: config.idle_evict(),
            keys: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        })
    }

    /// One token, in refill units.
    fn token_cost(&self) -> u128 {
        self.window.as_nanos()
    }

    fn capacity(&self) -> u128 {
        u128::from(self.max) * self.token_cost()
    }

    /// Check and, if admitted, consume one unit for `key`.
    pub fn try_acquire(&self, key: &str) -> Admission {
        let now = Instant::now();
        self.maybe_sweep(now);

        let mut entry = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| KeyWindow {
                state: self.fresh_state(now),
                last_seen: now,
            });
        let window = entry.value_mut();

        // A key idle past eviction is treated as new even if not yet swept.
        if now.saturating_duration_since(window.last_seen) >= self.idle_evict {
            window.state = self.fresh_state(now);
        }
        window.last_seen = now;

        let admission = match &mut window.state {
            KeyState::Fixed { window_start, count } => {
                let elapsed = now.saturating_duration_since(*window_start);
                if elapsed >= self.window {
                    // Snap to the boundary of the window containing `now`.
                    let elapsed = elapsed.as_nanos();
                    let skipped = elapsed - elapsed % self.window.as_nanos();
                    *window_start += Duration::from_nanos(u64::try_from(skipped).unwrap_or(u64::MAX));
                    *count = 0;
                }
                if *count < self.max {
                    *count += 1;
                    Admission::Allowed
                } else {
                    let reset_at = *window_start + self.window;
                    Admission::RateLimited {
                        retry_after: reset_at.saturating_duration_since(now),
                    }
                }
            }
            KeyState::Bucket { tokens, last_refill } => {
                let elapsed = now.saturating_duration_since(*last_refill).as_nanos();
                let refill = elapsed.saturating_mul(u128::from(self.max));
                *tokens = tokens.saturating_add(refill).min(self.capacity());
                *last_refill = now;

                let cost = self.token_cost();
                if *tokens >= cost {
                    *tokens -= cost;
                    Admission::Allowed
                } else {
                    let missing = cost - *tokens;
                    let wait_nanos = missing.div_ceil(u128::from(self.max));
                    Admission::RateLimited {
                        retry_after: Duration::from_nanos(
                            u64::try_from(wait_nanos).unwrap_or(u64::MAX),
                        ),
                    }
                }
            }
        };

        if let Admission::RateLimited { retry_after } = admission {
            tracing::debug!(key = %key, retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
        }
        admission
    }

    fn fresh_state(&self, now: Instant) -> KeyState {
        match self.strategy {
            RateLimitStrategy::Fixed => KeyState::Fixed {
                window_start: now,
                count: 0,
            },
            RateLimitStrategy::TokenBucket => KeyState::Bucket {
                tokens: self.capacity(),
                last_refill: now,
            },
        }
    }

    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(*last) < self.window {
                return;
            }
            *last = now;
        }
        self.evict_idle(now);
    }

    /// Drop every key idle for at least the eviction period.
    ///
    /// Returns the number of keys removed.
    pub fn sweep_idle(&self) -> usize {
        self.evict_idle(Instant::now())
    }

    fn evict_idle(&self, now: Instant) -> usize {
        let before = self.keys.len();
        self.keys
            .retain(|_, w| now.saturating_duration_since(w.last_seen) < self.idle_evict);
        let evicted = before.saturating_sub(self.keys.len());
        if evicted > 0 {
            tracing::trace!(evicted, remaining = self.keys.len(), "Evicted idle rate limit keys");
        }
        evicted
    }

    /// Number of keys currently holding state.
    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }
}

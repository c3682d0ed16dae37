//! Per-key policy registry.
//!
//! # Responsibilities
//! - Own exactly one set of policy instances per dependency key
//! - Build configured keys eagerly, unconfigured keys lazily from defaults
//! - Register readiness-critical breakers of configured keys with the
//!   health reporter
//! - Forget idle unconfigured keys
//!
//! # Design Decisions
//! - Only `dependencies` entries count toward readiness; a key first seen at
//!   call time is never readiness-critical, whatever the defaults say
//! - Unconfigured keys are evicted lazily: at most once per idle period, a
//!   lookup sweeps keys idle for longer than `registry.idle_evict_ms`
//! - An unconfigured key is kept while a call holds its policies, its
//!   bulkhead has active or queued callers, its breaker would still reject,
//!   or an observer is subscribed to it
//! - Lazily created keys are stamped from a prototype built (and validated)
//!   at construction, so lookup never fails
//! - Keys without their own `rate_limit` section share the default limiter

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::config::schema::{EngineConfig, ResolvedPolicies};
use crate::error::PolicyConfigError;
use crate::health::HealthReporter;
use crate::observability::metrics::UNCONFIGURED_KEY_LABEL;
use crate::resilience::bulkhead::Bulkhead;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::rate_limit::RateLimiter;
use crate::resilience::timeouts::{DetachedOperations, TimeoutPolicy};

/// Policy instances guarding one dependency key.
#[derive(Debug)]
pub(crate) struct KeyPolicies {
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub bulkhead: Option<Bulkhead>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub timeout: Option<TimeoutPolicy>,
    /// `key` label for metrics; shared by every unconfigured key.
    pub metric_label: Arc<str>,
    configured: bool,
    pinned: AtomicBool,
    /// Milliseconds since the registry epoch.
    last_used_ms: AtomicU64,
}

impl KeyPolicies {
    fn build(
        key: &str,
        resolved: &ResolvedPolicies,
        shared_limiter: Option<&Arc<RateLimiter>>,
        detached: &Arc<DetachedOperations>,
    ) -> Result<Self, PolicyConfigError> {
        let rate_limiter = match &resolved.rate_limit {
            None => None,
            Some(_) if resolved.rate_limit_shared => shared_limiter.cloned(),
            Some(config) => Some(Arc::new(RateLimiter::new(config)?)),
        };

        Ok(Self {
            rate_limiter,
            bulkhead: resolved.bulkhead.as_ref().map(Bulkhead::new).transpose()?,
            breaker: resolved
                .circuit_breaker
                .clone()
                .map(|config| CircuitBreaker::new(key, config))
                .transpose()?,
            timeout: resolved
                .timeout
                .as_ref()
                .map(|config| TimeoutPolicy::new(config, Arc::clone(detached)))
                .transpose()?,
            metric_label: Arc::from(key),
            configured: true,
            pinned: AtomicBool::new(false),
            last_used_ms: AtomicU64::new(0),
        })
    }

    /// Fresh state for an unconfigured `key` with this set's limits.
    fn instantiate(&self, key: &str, now_ms: u64) -> Self {
        Self {
            rate_limiter: self.rate_limiter.clone(),
            bulkhead: self.bulkhead.as_ref().map(Bulkhead::empty_like),
            breaker: self.breaker.as_ref().map(|b| b.fresh_for(key)),
            timeout: self.timeout.clone(),
            metric_label: Arc::from(UNCONFIGURED_KEY_LABEL),
            configured: false,
            pinned: AtomicBool::new(false),
            last_used_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_used_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    /// Whether nothing would notice this entry being dropped and rebuilt.
    /// The caller still has to rule out outstanding references.
    fn is_evictable(&self, now_ms: u64, idle_ms: u64) -> bool {
        if self.configured || self.pinned.load(Ordering::Acquire) {
            return false;
        }
        if now_ms.saturating_sub(self.last_used_ms.load(Ordering::Acquire)) < idle_ms {
            return false;
        }
        let bulkhead_idle = self.bulkhead.as_ref().map_or(true, |b| {
            let stats = b.stats();
            stats.active == 0 && stats.queued == 0
        });
        let breaker_idle = self.breaker.as_ref().map_or(true, |b| !b.would_reject());
        bulkhead_idle && breaker_idle
    }
}

#[derive(Debug)]
pub(crate) struct PolicyRegistry {
    entries: DashMap<String, Arc<KeyPolicies>>,
    prototype: KeyPolicies,
    health: HealthReporter,
    epoch: Instant,
    idle_evict: Duration,
    last_sweep: Mutex<Instant>,
}

impl PolicyRegistry {
    pub fn new(
        config: &EngineConfig,
        detached: &Arc<DetachedOperations>,
        health: HealthReporter,
    ) -> Result<Self, PolicyConfigError> {
        config.registry.validate()?;

        let shared_limiter = config
            .resolve_defaults()
            .rate_limit
            .as_ref()
            .map(RateLimiter::new)
            .transpose()?
            .map(Arc::new);

        let prototype = KeyPolicies::build(
            "defaults",
            &config.resolve_defaults(),
            shared_limiter.as_ref(),
            detached,
        )?;

        let now = Instant::now();
        let registry = Self {
            entries: DashMap::new(),
            prototype,
            health,
            epoch: now,
            idle_evict: config.registry.idle_evict(),
            last_sweep: Mutex::new(now),
        };

        for key in config.dependencies.keys() {
            let policies = KeyPolicies::build(
                key,
                &config.resolve(key),
                shared_limiter.as_ref(),
                detached,
            )?;
            if let Some(breaker) = &policies.breaker {
                registry.health.register(breaker);
            }
            registry.entries.insert(key.clone(), Arc::new(policies));
            tracing::debug!(key = %key, "Registered dependency policies");
        }

        Ok(registry)
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        u64::try_from(now.saturating_duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }

    /// Lookup without creating or touching the entry.
    pub fn get(&self, key: &str) -> Option<Arc<KeyPolicies>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Policies for `key`, created from the defaults on first use.
    pub fn get_or_create(&self, key: &str) -> Arc<KeyPolicies> {
        let now = Instant::now();
        self.maybe_sweep(now);
        let now_ms = self.millis_since_epoch(now);

        let policies = match self.get(key) {
            Some(existing) => existing,
            None => {
                let mut created = false;
                let policies = self
                    .entries
                    .entry(key.to_string())
                    .or_insert_with(|| {
                        created = true;
                        Arc::new(self.prototype.instantiate(key, now_ms))
                    })
                    .value()
                    .clone();
                if created {
                    tracing::debug!(key = %key, "Created default policies for new key");
                }
                policies
            }
        };

        policies.touch(now_ms);
        policies
    }

    /// Like [`get_or_create`], and exempt the entry from idle eviction.
    ///
    /// [`get_or_create`]: PolicyRegistry::get_or_create
    pub fn pin(&self, key: &str) -> Arc<KeyPolicies> {
        let policies = self.get_or_create(key);
        policies.pinned.store(true, Ordering::Release);
        policies
    }

    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(*last) < self.idle_evict {
                return;
            }
            *last = now;
        }
        self.evict_idle(now);
    }

    /// Drop every unconfigured key idle for at least the eviction period.
    ///
    /// Returns the number of keys removed.
    pub fn sweep_idle(&self) -> usize {
        self.evict_idle(Instant::now())
    }

    fn evict_idle(&self, now: Instant) -> usize {
        let now_ms = self.millis_since_epoch(now);
        let idle_ms = u64::try_from(self.idle_evict.as_millis()).unwrap_or(u64::MAX);

        let before = self.entries.len();
        // The shard write lock is held while deciding, so a reference taken
        // by a concurrent lookup shows up in the strong count.
        self.entries.retain(|_, policies| {
            Arc::strong_count(policies) > 1 || !policies.is_evictable(now_ms, idle_ms)
        });
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.entries.len(), "Evicted idle dependency keys");
        }
        evicted
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn breakers(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut breakers: Vec<Arc<CircuitBreaker>> = self
            .entries
            .iter()
            .filter_map(|e| e.value().breaker.clone())
            .collect();
        breakers.sort_by(|a, b| a.key().cmp(b.key()));
        breakers
    }

    /// Every distinct rate limiter in use.
    pub fn rate_limiters(&self) -> Vec<Arc<RateLimiter>> {
        let mut limiters: Vec<Arc<RateLimiter>> = Vec::new();
        let candidates = self
            .entries
            .iter()
            .filter_map(|e| e.value().rate_limiter.clone())
            .chain(self.prototype.rate_limiter.clone());
        for limiter in candidates {
            if !limiters.iter().any(|known| Arc::ptr_eq(known, &limiter)) {
                limiters.push(limiter);
            }
        }
        limiters
    }
}

//! Per-scope rate limiting and concurrency caps.
//!
//! Limits are enforced against external atomic counters so that every
//! worker process sharing a scope observes the same budget. The limiter
//! itself is stateless: it derives a fixed-window bucket key and asks the
//! store for an atomic increment-and-read.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::AppError;

/// The entity a rate limit is independently enforced against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Tenant(String),
    Queue { tenant_id: String, queue_id: String },
    UrlGroup(String),
}

impl Scope {
    /// Stable store key for this scope.
    pub fn key(&self) -> String {
        match self {
            Scope::Tenant(t) => format!("tenant:{t}"),
            Scope::Queue {
                tenant_id,
                queue_id,
            } => format!("queue:{tenant_id}:{queue_id}"),
            Scope::UrlGroup(g) => format!("group:{g}"),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A fixed-window request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Requests allowed per window.
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn per_second(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(1),
        }
    }

    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Result of a rate-limit check. Denial never costs the job a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after: Duration },
}

/// Shared atomic counter store backing the rate limiter.
///
/// `window` is the lifetime of the bucket named by `key`; implementations
/// may use it as a TTL. The increment must be atomic across workers.
pub trait RateCounterStore: Send + Sync + Clone {
    fn increment_and_get(
        &self,
        key: &str,
        window: Duration,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Shared semaphore-style slot store for concurrency caps.
///
/// Distinct from the per-window rate: a slot is acquired before execution
/// and released after, success or failure.
pub trait ConcurrencySlots: Send + Sync + Clone + 'static {
    /// Atomically take a slot if fewer than `max` are held for `key`.
    fn try_acquire(
        &self,
        key: &str,
        max: u32,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn release(&self, key: &str) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Fixed-window rate limiter over a shared counter store.
#[derive(Clone)]
pub struct RateLimiter<S: RateCounterStore> {
    store: S,
}

impl<S: RateCounterStore> RateLimiter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Check one scope against its policy.
    ///
    /// On denial, `retry_after` is the remainder of the current window:
    /// the earliest instant the budget resets.
    pub async fn try_acquire(
        &self,
        scope: &Scope,
        policy: &RateLimitPolicy,
    ) -> Result<RateDecision, AppError> {
        let window_secs = policy.window.as_secs().max(1);
        let now = Utc::now().timestamp().max(0) as u64;
        let bucket = now / window_secs;
        let key = format!("rl:{}:{}", scope.key(), bucket);

        let count = self.store.increment_and_get(&key, policy.window).await?;

        if count <= u64::from(policy.limit) {
            Ok(RateDecision::Allowed)
        } else {
            let retry_after = Duration::from_secs((bucket + 1) * window_secs - now);
            tracing::debug!(
                scope = %scope,
                count,
                limit = policy.limit,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit denied"
            );
            Ok(RateDecision::Denied { retry_after })
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store implementations for single-process deployments and tests.
// ---------------------------------------------------------------------------

/// Process-local [`RateCounterStore`].
#[derive(Clone, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<Mutex<HashMap<String, (u64, Instant)>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (u64, Instant)>> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RateCounterStore for InMemoryCounterStore {
    async fn increment_and_get(&self, key: &str, window: Duration) -> Result<u64, AppError> {
        let mut counters = self.lock();
        let now = Instant::now();
        counters.retain(|_, (_, expires)| *expires > now);
        let entry = counters
            .entry(key.to_string())
            .or_insert((0, now + window));
        entry.0 += 1;
        Ok(entry.0)
    }
}

/// Process-local [`ConcurrencySlots`].
#[derive(Clone, Default)]
pub struct InMemorySlots {
    held: Arc<Mutex<HashMap<String, u32>>>,
}

impl InMemorySlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of slots currently held for a key.
    pub fn held(&self, key: &str) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }
}

impl ConcurrencySlots for InMemorySlots {
    async fn try_acquire(&self, key: &str, max: u32) -> Result<bool, AppError> {
        let mut held = self.lock();
        let count = held.entry(key.to_string()).or_insert(0);
        if *count < max {
            *count += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        let mut held = self.lock();
        if let Some(count) = held.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }
}

//! Per-URL-group circuit breaker for endpoint resilience.
//!
//! Protects against cascading failures when a target endpoint family
//! experiences issues.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[probes succeed]---------------------+
//! ```
//!
//! Breaker state is shared by every worker targeting the group, so all
//! reads and writes go through a [`BreakerStore`] and mutate only via
//! compare-and-set. A worker never holds the state; it holds a snapshot
//! and retries on contention.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited probes allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior, from the URL group.
#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to HalfOpen.
    pub trip_duration: Duration,

    /// Probes admitted while half-open; this many successes with no
    /// intervening failure close the circuit.
    pub half_open_max_probes: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            trip_duration: Duration::from_secs(30),
            half_open_max_probes: 2,
        }
    }
}

/// Persisted breaker state for one URL group.
///
/// Wall-clock timestamps rather than process-local instants: the snapshot
/// is shared by workers on different machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub half_open_successes: u32,
    pub half_open_in_flight: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            last_error: None,
        }
    }
}

/// Result of asking the breaker to admit a dispatch.
///
/// `probe` is true when the admission took a half-open probe slot; the
/// caller must then resolve the probe with `record_success` /
/// `record_failure`, or hand the slot back with [`CircuitBreaker::release_probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { probe: bool },
    Rejected { retry_after: Duration },
}

/// Linearizable store for breaker snapshots, keyed by URL group.
///
/// `get` of an unknown key returns the default (closed) snapshot; rows
/// are created lazily on first write. `compare_and_set` must apply the
/// new snapshot only if the stored one still equals `expected`.
pub trait BreakerStore: Send + Sync + Clone + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<BreakerSnapshot, AppError>> + Send;

    fn compare_and_set(
        &self,
        key: &str,
        expected: &BreakerSnapshot,
        new: &BreakerSnapshot,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Bound on CAS retries before giving up on a contended update.
const MAX_CAS_ATTEMPTS: u32 = 8;

/// Rejection delay while all half-open probe slots are taken; probes
/// resolve on the order of one request round trip.
const PROBE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Circuit breaker for one URL group, backed by a shared store.
///
/// Cheap to construct: workers build one per job from the group id and a
/// clone of the store handle.
#[derive(Clone)]
pub struct CircuitBreaker<S: BreakerStore> {
    group_id: String,
    policy: BreakerPolicy,
    store: S,
}

impl<S: BreakerStore> CircuitBreaker<S> {
    pub fn new(group_id: impl Into<String>, policy: BreakerPolicy, store: S) -> Self {
        Self {
            group_id: group_id.into(),
            policy,
            store,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Time left on an open circuit's trip, given its snapshot.
    fn remaining_trip(&self, snapshot: &BreakerSnapshot) -> Duration {
        let opened_at = match snapshot.opened_at {
            Some(t) => t,
            None => return Duration::ZERO,
        };
        let elapsed = (Utc::now() - opened_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.policy.trip_duration.saturating_sub(elapsed)
    }

    /// Current effective state, viewing an elapsed Open trip as HalfOpen.
    pub async fn state(&self) -> Result<CircuitState, AppError> {
        let snapshot = self.store.get(&self.group_id).await?;
        if snapshot.state == CircuitState::Open && self.remaining_trip(&snapshot).is_zero() {
            return Ok(CircuitState::HalfOpen);
        }
        Ok(snapshot.state)
    }

    /// Decide whether a dispatch to this group may proceed.
    ///
    /// - Closed: allowed, no write.
    /// - Open: rejected with the remaining trip duration; once the trip
    ///   has elapsed the caller is admitted as the first half-open probe.
    /// - HalfOpen: admitted while probe slots remain, else rejected.
    pub async fn admit(&self) -> Result<Admission, AppError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.store.get(&self.group_id).await?;

            match snapshot.state {
                CircuitState::Closed => return Ok(Admission::Allowed { probe: false }),
                CircuitState::Open => {
                    let remaining = self.remaining_trip(&snapshot);
                    if !remaining.is_zero() {
                        return Ok(Admission::Rejected {
                            retry_after: remaining,
                        });
                    }
                    // Trip elapsed: move to half-open and take the first
                    // probe slot in the same atomic step.
                    let new = BreakerSnapshot {
                        state: CircuitState::HalfOpen,
                        half_open_successes: 0,
                        half_open_in_flight: 1,
                        ..snapshot.clone()
                    };
                    if self.store.compare_and_set(&self.group_id, &snapshot, &new).await? {
                        tracing::info!(
                            group = %self.group_id,
                            "Circuit breaker transitioning to half-open state"
                        );
                        return Ok(Admission::Allowed { probe: true });
                    }
                }
                CircuitState::HalfOpen => {
                    if snapshot.half_open_in_flight >= self.policy.half_open_max_probes {
                        return Ok(Admission::Rejected {
                            retry_after: PROBE_RETRY_AFTER,
                        });
                    }
                    let new = BreakerSnapshot {
                        half_open_in_flight: snapshot.half_open_in_flight + 1,
                        ..snapshot.clone()
                    };
                    if self.store.compare_and_set(&self.group_id, &snapshot, &new).await? {
                        return Ok(Admission::Allowed { probe: true });
                    }
                }
            }
        }

        Err(AppError::Store(format!(
            "breaker CAS contention exhausted for group '{}'",
            self.group_id
        )))
    }

    /// Record a successful dispatch.
    pub async fn record_success(&self) -> Result<(), AppError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.store.get(&self.group_id).await?;

            let new = match snapshot.state {
                // Late result from before a trip; nothing to do.
                CircuitState::Open => return Ok(()),
                CircuitState::Closed => {
                    if snapshot.failures == 0 {
                        return Ok(());
                    }
                    BreakerSnapshot {
                        failures: 0,
                        last_error: None,
                        ..snapshot.clone()
                    }
                }
                CircuitState::HalfOpen => {
                    let successes = snapshot.half_open_successes + 1;
                    if successes >= self.policy.half_open_max_probes {
                        tracing::info!(
                            group = %self.group_id,
                            probes = successes,
                            "Circuit breaker closing after successful probes"
                        );
                        BreakerSnapshot::default()
                    } else {
                        BreakerSnapshot {
                            half_open_successes: successes,
                            half_open_in_flight: snapshot.half_open_in_flight.saturating_sub(1),
                            ..snapshot.clone()
                        }
                    }
                }
            };

            if self.store.compare_and_set(&self.group_id, &snapshot, &new).await? {
                return Ok(());
            }
        }

        Err(AppError::Store(format!(
            "breaker CAS contention exhausted for group '{}'",
            self.group_id
        )))
    }

    /// Record a circuit-tripping failure.
    pub async fn record_failure(&self, error: &AppError) -> Result<(), AppError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.store.get(&self.group_id).await?;

            let new = match snapshot.state {
                // Already open; the rejection path owns the state.
                CircuitState::Open => return Ok(()),
                CircuitState::Closed => {
                    let failures = snapshot.failures + 1;
                    if failures >= self.policy.failure_threshold {
                        tracing::warn!(
                            group = %self.group_id,
                            failures,
                            error = %error,
                            "Circuit breaker opening after consecutive failures"
                        );
                        BreakerSnapshot {
                            state: CircuitState::Open,
                            failures,
                            opened_at: Some(Utc::now()),
                            last_error: Some(error.to_string()),
                            ..BreakerSnapshot::default()
                        }
                    } else {
                        BreakerSnapshot {
                            failures,
                            last_error: Some(error.to_string()),
                            ..snapshot.clone()
                        }
                    }
                }
                CircuitState::HalfOpen => {
                    tracing::warn!(
                        group = %self.group_id,
                        error = %error,
                        "Circuit breaker probe failed, returning to open state"
                    );
                    BreakerSnapshot {
                        state: CircuitState::Open,
                        failures: snapshot.failures,
                        half_open_successes: 0,
                        half_open_in_flight: 0,
                        opened_at: Some(Utc::now()),
                        last_error: Some(error.to_string()),
                    }
                }
            };

            if self.store.compare_and_set(&self.group_id, &snapshot, &new).await? {
                return Ok(());
            }
        }

        Err(AppError::Store(format!(
            "breaker CAS contention exhausted for group '{}'",
            self.group_id
        )))
    }

    /// Hand back a probe slot taken by `admit` whose dispatch never
    /// produced an outcome for the breaker to record. Without this a
    /// probe that ends in a non-tripping failure, a cancellation, or a
    /// parked job would hold its slot forever and wedge the circuit
    /// half-open.
    pub async fn release_probe(&self) -> Result<(), AppError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.store.get(&self.group_id).await?;
            // A concurrent probe already resolved the half-open phase.
            if snapshot.state != CircuitState::HalfOpen || snapshot.half_open_in_flight == 0 {
                return Ok(());
            }
            let new = BreakerSnapshot {
                half_open_in_flight: snapshot.half_open_in_flight - 1,
                ..snapshot.clone()
            };
            if self.store.compare_and_set(&self.group_id, &snapshot, &new).await? {
                return Ok(());
            }
        }
        Err(AppError::Store(format!(
            "breaker CAS contention exhausted for group '{}'",
            self.group_id
        )))
    }

    /// Force the breaker back to closed.
    pub async fn reset(&self) -> Result<(), AppError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let snapshot = self.store.get(&self.group_id).await?;
            let new = BreakerSnapshot::default();
            if self.store.compare_and_set(&self.group_id, &snapshot, &new).await? {
                tracing::info!(group = %self.group_id, "Circuit breaker manually reset");
                return Ok(());
            }
        }
        Err(AppError::Store(format!(
            "breaker CAS contention exhausted for group '{}'",
            self.group_id
        )))
    }
}

// ---------------------------------------------------------------------------
// In-memory store for single-process deployments and tests.
// ---------------------------------------------------------------------------

/// Process-local [`BreakerStore`].
#[derive(Clone, Default)]
pub struct InMemoryBreakerStore {
    snapshots: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<String, BreakerSnapshot>>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, BreakerSnapshot>> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BreakerStore for InMemoryBreakerStore {
    async fn get(&self, key: &str) -> Result<BreakerSnapshot, AppError> {
        Ok(self.lock().get(key).cloned().unwrap_or_default())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &BreakerSnapshot,
        new: &BreakerSnapshot,
    ) -> Result<bool, AppError> {
        let mut snapshots = self.lock();
        let current = snapshots.get(key).cloned().unwrap_or_default();
        if current == *expected {
            snapshots.insert(key.to_string(), new.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

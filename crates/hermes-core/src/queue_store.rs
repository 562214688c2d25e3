//! Durable queue state boundary.
//!
//! The store is the sole arbiter of job ownership: workers never hold a
//! job directly, only an opaque [`LeaseToken`] returned by an atomic
//! claim. Implementations must make `claim_next` conditional (at most one
//! live lease per job) and treat every mutation as invalid once the lease
//! has expired or been superseded.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CreateJobRequest, Job, JobStatus};

/// Opaque, time-bounded claim on one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for LeaseToken {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Persistent job queue with lease-based claiming.
///
/// Implementations must support atomic claiming via
/// `SELECT FOR UPDATE SKIP LOCKED` or equivalent, so that per job id at
/// most one worker holds an in-progress lease at a time. An expired lease
/// is reclaimable by any worker, and the interrupted attempt counts
/// toward the job's retries.
pub trait QueueStore: Send + Sync + Clone {
    /// Producer side: insert a Pending job due immediately.
    fn enqueue(
        &self,
        request: CreateJobRequest,
    ) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Atomically move one due job (status Pending, `next_execution <=
    /// now`) to InProgress under a fresh lease. Returns `None` when no
    /// job is due.
    fn claim_next(
        &self,
        tenant_id: &str,
        queue_id: &str,
        lease_ttl: Duration,
    ) -> impl Future<Output = Result<Option<(Job, LeaseToken)>, AppError>> + Send;

    /// Extend the lease; fails with [`AppError::LeaseExpired`] if the
    /// token no longer owns the job.
    fn renew_lease(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        lease_ttl: Duration,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Atomically remove the job from processing with a terminal status.
    fn complete(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        status: JobStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Atomically move the job back to pending with updated fields and a
    /// new due time.
    fn reenqueue(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        job: &Job,
        next_execution: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Atomically move the job to the per-tenant failed list, retaining
    /// its full error history.
    fn dead_letter(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        job: &Job,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Cancellation probe, checked at suspension points during
    /// processing.
    fn is_cancelled(&self, job_id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Request cancellation of a non-terminal job.
    fn cancel(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Dead-lettered jobs for a tenant, newest first.
    fn list_dead_letters(
        &self,
        tenant_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store for single-process deployments and tests.
// ---------------------------------------------------------------------------

struct StoredJob {
    job: Job,
    lease: Option<(LeaseToken, DateTime<Utc>)>,
}

#[derive(Default)]
struct InMemoryInner {
    jobs: HashMap<Uuid, StoredJob>,
    /// Dead-letter order per tenant, newest last.
    dead: Vec<Uuid>,
}

/// Process-local [`QueueStore`] with full lease semantics.
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    inner: Arc<Mutex<InMemoryInner>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate that `token` still owns `job_id`.
    fn check_lease(
        inner: &InMemoryInner,
        job_id: Uuid,
        token: &LeaseToken,
    ) -> Result<(), AppError> {
        let stored = inner
            .jobs
            .get(&job_id)
            .ok_or_else(|| AppError::Store(format!("unknown job {job_id}")))?;
        match &stored.lease {
            Some((held, expires)) if held == token && *expires > Utc::now() => Ok(()),
            _ => Err(AppError::LeaseExpired),
        }
    }

    /// Return expired InProgress jobs to pending, charging a retry; jobs
    /// with none left go straight to the dead-letter list.
    fn reclaim_expired(inner: &mut InMemoryInner, tenant_id: &str, queue_id: &str) {
        let now = Utc::now();
        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|s| {
                s.job.tenant_id == tenant_id
                    && s.job.queue_id == queue_id
                    && s.job.status == JobStatus::InProgress
                    && matches!(&s.lease, Some((_, expires)) if *expires <= now)
            })
            .map(|s| s.job.id)
            .collect();

        for id in expired {
            if let Some(stored) = inner.jobs.get_mut(&id) {
                stored.lease = None;
                stored
                    .job
                    .record_error(AppError::LeaseExpired.to_string(), None, None);
                if stored.job.retries_left > 0 {
                    stored.job.retries_left -= 1;
                    stored.job.status = JobStatus::Pending;
                    stored.job.next_execution = now;
                } else {
                    stored.job.status = JobStatus::Failed;
                    inner.dead.push(id);
                }
            }
        }
    }
}

impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, request: CreateJobRequest) -> Result<Job, AppError> {
        let job = request.into_job();
        let mut inner = self.lock();
        inner.jobs.insert(
            job.id,
            StoredJob {
                job: job.clone(),
                lease: None,
            },
        );
        Ok(job)
    }

    async fn claim_next(
        &self,
        tenant_id: &str,
        queue_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<(Job, LeaseToken)>, AppError> {
        let mut inner = self.lock();
        Self::reclaim_expired(&mut inner, tenant_id, queue_id);

        let now = Utc::now();
        let due = inner
            .jobs
            .values()
            .filter(|s| {
                s.job.tenant_id == tenant_id
                    && s.job.queue_id == queue_id
                    && s.job.status == JobStatus::Pending
                    && s.job.next_execution <= now
            })
            .min_by_key(|s| s.job.next_execution)
            .map(|s| s.job.id);

        let Some(id) = due else { return Ok(None) };

        let token = LeaseToken::new();
        let lease_ttl =
            chrono::TimeDelta::from_std(lease_ttl).unwrap_or(chrono::TimeDelta::seconds(60));
        let stored = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::Store(format!("unknown job {id}")))?;
        stored.job.status = JobStatus::InProgress;
        stored.lease = Some((token, now + lease_ttl));
        Ok(Some((stored.job.clone(), token)))
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        lease_ttl: Duration,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        Self::check_lease(&inner, job_id, token)?;
        let expires = Utc::now()
            + chrono::TimeDelta::from_std(lease_ttl).unwrap_or(chrono::TimeDelta::seconds(60));
        if let Some(stored) = inner.jobs.get_mut(&job_id) {
            stored.lease = Some((*token, expires));
        }
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        status: JobStatus,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        Self::check_lease(&inner, job_id, token)?;
        if let Some(stored) = inner.jobs.get_mut(&job_id) {
            // A cancellation persisted mid-flight wins over any later
            // terminal write from the worker.
            if stored.job.status != JobStatus::Cancelled {
                stored.job.status = status;
            }
            stored.lease = None;
        }
        Ok(())
    }

    async fn reenqueue(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        job: &Job,
        next_execution: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        Self::check_lease(&inner, job_id, token)?;
        if let Some(stored) = inner.jobs.get_mut(&job_id) {
            // A cancellation persisted mid-flight wins over the
            // reschedule; the lease is still surrendered.
            let cancelled = stored.job.status == JobStatus::Cancelled;
            stored.job = job.clone();
            stored.job.status = if cancelled {
                JobStatus::Cancelled
            } else {
                JobStatus::Pending
            };
            stored.job.next_execution = next_execution;
            stored.lease = None;
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        job: &Job,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        Self::check_lease(&inner, job_id, token)?;
        let mut cancelled = false;
        if let Some(stored) = inner.jobs.get_mut(&job_id) {
            // A cancellation persisted mid-flight wins over the failure;
            // a cancelled job never joins the dead-letter list.
            cancelled = stored.job.status == JobStatus::Cancelled;
            stored.job = job.clone();
            stored.job.status = if cancelled {
                JobStatus::Cancelled
            } else {
                JobStatus::Failed
            };
            stored.lease = None;
        }
        if !cancelled {
            inner.dead.push(job_id);
        }
        Ok(())
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, AppError> {
        let inner = self.lock();
        Ok(inner
            .jobs
            .get(&job_id)
            .is_some_and(|s| s.job.status == JobStatus::Cancelled))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.lock();
        if let Some(stored) = inner.jobs.get_mut(&job_id)
            && !stored.job.status.is_terminal()
        {
            stored.job.status = JobStatus::Cancelled;
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let inner = self.lock();
        Ok(inner.jobs.get(&job_id).map(|s| s.job.clone()))
    }

    async fn list_dead_letters(&self, tenant_id: &str, limit: usize) -> Result<Vec<Job>, AppError> {
        let inner = self.lock();
        Ok(inner
            .dead
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|s| s.job.tenant_id == tenant_id)
            .take(limit)
            .map(|s| s.job.clone())
            .collect())
    }
}

//! Worker loop: claim, renew, process, repeat.
//!
//! A worker is assigned a set of queues and polls them round-robin. All
//! coordination between workers happens through the queue store's lease
//! protocol, so any number of workers (in any number of processes) can
//! share the same queues.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::BreakerStore;
use crate::config::ConfigResolver;
use crate::job::{Job, WorkerConfig};
use crate::processor::{JobProcessor, Outcome};
use crate::queue_store::{LeaseToken, QueueStore};
use crate::rate_limit::{ConcurrencySlots, RateCounterStore};
use crate::request::HttpDispatcher;

/// Observable worker lifecycle events.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Claimed {
        job_id: Uuid,
        tenant_id: String,
        queue_id: String,
    },
    Processed {
        job_id: Uuid,
        outcome: Outcome,
    },
    /// No due job on any assigned queue; the worker sleeps a poll interval.
    Idle,
    /// A claim attempt failed against the store.
    ClaimFailed {
        tenant_id: String,
        queue_id: String,
        message: String,
    },
}

/// Sink for worker events. Implementations must be cheap; the worker
/// calls this inline.
pub trait WorkerReporter: Send + Sync + Clone {
    fn report(&self, worker_id: &str, event: &WorkerEvent);
}

/// Default reporter that maps events onto tracing.
#[derive(Debug, Clone, Default)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, worker_id: &str, event: &WorkerEvent) {
        match event {
            WorkerEvent::Claimed {
                job_id,
                tenant_id,
                queue_id,
            } => {
                tracing::info!(
                    worker = worker_id,
                    job_id = %job_id,
                    tenant = %tenant_id,
                    queue = %queue_id,
                    "Claimed job"
                );
            }
            WorkerEvent::Processed { job_id, outcome } => {
                tracing::info!(worker = worker_id, job_id = %job_id, outcome = ?outcome, "Processed job");
            }
            WorkerEvent::Idle => {
                tracing::trace!(worker = worker_id, "No due jobs, idling");
            }
            WorkerEvent::ClaimFailed {
                tenant_id,
                queue_id,
                message,
            } => {
                tracing::error!(
                    worker = worker_id,
                    tenant = %tenant_id,
                    queue = %queue_id,
                    error = %message,
                    "Claim failed"
                );
            }
        }
    }
}

/// A tenant/queue pair a worker is assigned to drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAssignment {
    pub tenant_id: String,
    pub queue_id: String,
}

impl QueueAssignment {
    pub fn new(tenant_id: impl Into<String>, queue_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queue_id: queue_id.into(),
        }
    }
}

/// One worker task: polls its assigned queues and drives each claimed
/// job through the processor while keeping the lease renewed.
#[derive(Clone)]
pub struct WorkerService<Q, R, D, C, SL, B, Rep>
where
    Q: QueueStore,
    R: ConfigResolver,
    D: HttpDispatcher,
    C: RateCounterStore,
    SL: ConcurrencySlots,
    B: BreakerStore,
    Rep: WorkerReporter,
{
    store: Q,
    processor: JobProcessor<Q, R, D, C, SL, B>,
    assignments: Vec<QueueAssignment>,
    config: WorkerConfig,
    reporter: Rep,
}

impl<Q, R, D, C, SL, B, Rep> WorkerService<Q, R, D, C, SL, B, Rep>
where
    Q: QueueStore,
    R: ConfigResolver,
    D: HttpDispatcher,
    C: RateCounterStore,
    SL: ConcurrencySlots,
    B: BreakerStore,
    Rep: WorkerReporter,
{
    pub fn new(
        store: Q,
        processor: JobProcessor<Q, R, D, C, SL, B>,
        assignments: Vec<QueueAssignment>,
        config: WorkerConfig,
        reporter: Rep,
    ) -> Self {
        Self {
            store,
            processor,
            assignments,
            config,
            reporter,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll-process loop until cancellation. In-flight jobs run to their
    /// persisted decision before the loop exits.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            worker = %self.config.worker_id,
            queues = self.assignments.len(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let worked = self.poll_once().await;

            if !worked {
                self.reporter.report(&self.config.worker_id, &WorkerEvent::Idle);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        tracing::info!(worker = %self.config.worker_id, "Worker stopped");
    }

    /// One pass over the assigned queues. Returns whether any job was
    /// claimed and processed.
    pub async fn poll_once(&self) -> bool {
        let mut worked = false;
        for assignment in &self.assignments {
            match self
                .store
                .claim_next(
                    &assignment.tenant_id,
                    &assignment.queue_id,
                    self.config.lease_ttl,
                )
                .await
            {
                Ok(Some((job, token))) => {
                    self.reporter.report(
                        &self.config.worker_id,
                        &WorkerEvent::Claimed {
                            job_id: job.id,
                            tenant_id: job.tenant_id.clone(),
                            queue_id: job.queue_id.clone(),
                        },
                    );
                    let outcome = self.process_with_renewal(&job, &token).await;
                    self.reporter.report(
                        &self.config.worker_id,
                        &WorkerEvent::Processed {
                            job_id: job.id,
                            outcome,
                        },
                    );
                    worked = true;
                }
                Ok(None) => {}
                Err(e) => {
                    self.reporter.report(
                        &self.config.worker_id,
                        &WorkerEvent::ClaimFailed {
                            tenant_id: assignment.tenant_id.clone(),
                            queue_id: assignment.queue_id.clone(),
                            message: e.to_string(),
                        },
                    );
                }
            }
        }
        worked
    }

    /// Run the processor while renewing the lease at half-TTL cadence, so
    /// jobs slower than the TTL are not reclaimed mid-flight. A failed
    /// renewal means ownership is gone and the attempt is abandoned.
    async fn process_with_renewal(&self, job: &Job, token: &LeaseToken) -> Outcome {
        let renew_every = self.config.lease_ttl / 2;
        tokio::select! {
            outcome = self.processor.process(job, token) => outcome,
            reason = self.renew_until_failure(job.id, token, renew_every) => {
                tracing::error!(
                    worker = %self.config.worker_id,
                    job_id = %job.id,
                    error = %reason,
                    "Lost lease mid-flight, abandoning attempt"
                );
                Outcome::Abandoned { reason }
            }
        }
    }

    /// Resolves only when a renewal fails, with the failure message.
    async fn renew_until_failure(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        renew_every: Duration,
    ) -> String {
        loop {
            tokio::time::sleep(renew_every).await;
            if let Err(e) = self
                .store
                .renew_lease(job_id, token, self.config.lease_ttl)
                .await
            {
                return e.to_string();
            }
        }
    }
}

/// Runs `size` clones of a worker service concurrently, each with its
/// own worker id, until the token is cancelled.
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub async fn run<Q, R, D, C, SL, B, Rep>(
        &self,
        service: WorkerService<Q, R, D, C, SL, B, Rep>,
        cancel: CancellationToken,
    ) where
        Q: QueueStore + 'static,
        R: ConfigResolver + 'static,
        D: HttpDispatcher + 'static,
        C: RateCounterStore + 'static,
        SL: ConcurrencySlots + 'static,
        B: BreakerStore + 'static,
        Rep: WorkerReporter + 'static,
    {
        let mut handles = Vec::with_capacity(self.size);
        for i in 0..self.size {
            let mut worker = service.clone();
            worker.config.worker_id = format!("{}-{}", service.config.worker_id, i);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { worker.run(cancel).await }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

//! One job's lifecycle: config resolution, admission gates, dispatch,
//! classification, and the resulting state transition.
//!
//! Every exit from [`JobProcessor::process`] persists exactly one
//! decision through the queue store under the held lease, except store
//! failures, which abandon the claim and leave the lease to expire (the
//! store stays the single source of truth; we never write with an
//! uncertain outcome).

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::circuit_breaker::{Admission, BreakerStore, CircuitBreaker};
use crate::config::{ConfigResolver, QueueConfig, UrlGroup};
use crate::error::AppError;
use crate::job::{Job, JobStatus};
use crate::queue_store::{LeaseToken, QueueStore};
use crate::rate_limit::{
    ConcurrencySlots, RateCounterStore, RateDecision, RateLimiter, RateLimitPolicy, Scope,
};
use crate::request::{HttpDispatcher, build_request};
use crate::retry::{RetryDecision, RetryPolicy, schedule};

/// Delay before retrying a job parked by a disabled queue or a full
/// concurrency gate. No execution attempt happened, so no retry is
/// consumed either way.
const PAUSE_RETRY_AFTER: Duration = Duration::from_secs(30);
const SLOT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Terminal result of processing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx from the endpoint; job persisted Completed.
    Completed,
    /// A rate-limit scope denied dispatch; rescheduled, no retry consumed.
    RateLimited { scope: String, retry_after: Duration },
    /// The group's breaker is open; rescheduled, no retry consumed.
    CircuitOpen { retry_after: Duration },
    /// Retryable failure with retries left; retry consumed.
    Reenqueued { next_execution: DateTime<Utc> },
    /// Fatal or exhausted; job frozen on the dead-letter list.
    DeadLettered,
    /// External cancellation observed before a terminal write.
    Cancelled,
    /// A store operation failed mid-decision; the claim was abandoned
    /// and the lease left to expire for reclaim.
    Abandoned { reason: String },
}

/// Processes claimed jobs. Generic over every external dependency via
/// traits, enabling dependency injection and testability without real
/// HTTP or a real store.
#[derive(Clone)]
pub struct JobProcessor<Q, R, D, C, SL, B>
where
    Q: QueueStore,
    R: ConfigResolver,
    D: HttpDispatcher,
    C: RateCounterStore,
    SL: ConcurrencySlots,
    B: BreakerStore,
{
    store: Q,
    resolver: R,
    dispatcher: D,
    limiter: RateLimiter<C>,
    slots: SL,
    breaker_store: B,
}

impl<Q, R, D, C, SL, B> JobProcessor<Q, R, D, C, SL, B>
where
    Q: QueueStore,
    R: ConfigResolver,
    D: HttpDispatcher,
    C: RateCounterStore,
    SL: ConcurrencySlots,
    B: BreakerStore,
{
    pub fn new(
        store: Q,
        resolver: R,
        dispatcher: D,
        limiter: RateLimiter<C>,
        slots: SL,
        breaker_store: B,
    ) -> Self {
        Self {
            store,
            resolver,
            dispatcher,
            limiter,
            slots,
            breaker_store,
        }
    }

    /// Run one claimed job to a persisted decision.
    pub async fn process(&self, job: &Job, token: &LeaseToken) -> Outcome {
        let mut job = job.clone();

        // Cancellation gate before any work.
        match self.store.is_cancelled(job.id).await {
            Ok(true) => return self.finish_cancelled(&job, token).await,
            Ok(false) => {}
            Err(e) => return Self::abandon(&job, e),
        }

        // Dispatch-time configuration snapshot.
        let queue = match self.resolver.queue(&job.tenant_id, &job.queue_id).await {
            Ok(q) => q,
            Err(e) => return Self::abandon(&job, e),
        };
        if let Some(q) = &queue
            && !q.enabled
        {
            tracing::debug!(job_id = %job.id, queue = %job.queue_id, "Queue disabled, parking job");
            return self
                .reschedule_for_free(&job, token, PAUSE_RETRY_AFTER, |retry_after| {
                    Outcome::RateLimited {
                        scope: format!("queue:{}:{}", job.tenant_id, job.queue_id),
                        retry_after,
                    }
                })
                .await;
        }

        let group = match self.resolve_group(&job, queue.as_ref()).await {
            Ok(g) => g,
            Err(AppError::Configuration(msg)) => {
                return self
                    .fail_fatal(&mut job, token, AppError::Configuration(msg))
                    .await;
            }
            Err(e) => return Self::abandon(&job, e),
        };

        // Rate limits: tenant, then queue, then URL group. First denial
        // wins and costs nothing.
        match self.check_rate_limits(&job, queue.as_ref(), group.as_ref()).await {
            Ok(None) => {}
            Ok(Some((scope, retry_after))) => {
                return self
                    .reschedule_for_free(&job, token, retry_after, |retry_after| {
                        Outcome::RateLimited {
                            scope: scope.key(),
                            retry_after,
                        }
                    })
                    .await;
            }
            Err(e) => return Self::abandon(&job, e),
        }

        // Circuit breaker, only when the job targets a URL group.
        let breaker = group.as_ref().map(|g| {
            CircuitBreaker::new(g.group_id.clone(), g.breaker.clone(), self.breaker_store.clone())
        });
        let mut probe = ProbeGuard::none();
        if let Some(breaker) = &breaker {
            match breaker.admit().await {
                Ok(Admission::Allowed { probe: took_slot }) => {
                    if took_slot {
                        probe = ProbeGuard::armed(breaker.clone());
                    }
                }
                Ok(Admission::Rejected { retry_after }) => {
                    tracing::debug!(
                        job_id = %job.id,
                        group = breaker.group_id(),
                        retry_after_secs = retry_after.as_secs(),
                        "Circuit open, rescheduling"
                    );
                    return self
                        .reschedule_for_free(&job, token, retry_after, |retry_after| {
                            Outcome::CircuitOpen { retry_after }
                        })
                        .await;
                }
                Err(e) => return Self::abandon(&job, e),
            }
        }

        // Sign and build; failure here is fatal for the job.
        let request = match build_request(&job, group.as_ref()) {
            Ok(r) => r,
            Err(e) => {
                probe.give_back().await;
                return self.fail_fatal(&mut job, token, e).await;
            }
        };

        // Concurrency slots, queue-level then group-level.
        let slots = match self.acquire_slots(queue.as_ref(), group.as_ref()).await {
            Ok(Some(slots)) => slots,
            Ok(None) => {
                probe.give_back().await;
                return self
                    .reschedule_for_free(&job, token, SLOT_RETRY_AFTER, |retry_after| {
                        Outcome::RateLimited {
                            scope: "concurrency".into(),
                            retry_after,
                        }
                    })
                    .await;
            }
            Err(e) => {
                probe.give_back().await;
                return Self::abandon(&job, e);
            }
        };

        // Cancellation re-check after the store round trips above, right
        // before the irreversible dispatch.
        match self.store.is_cancelled(job.id).await {
            Ok(true) => {
                slots.release().await;
                probe.give_back().await;
                return self.finish_cancelled(&job, token).await;
            }
            Ok(false) => {}
            Err(e) => {
                slots.release().await;
                probe.give_back().await;
                return Self::abandon(&job, e);
            }
        }

        let result = self.dispatcher.execute(&request).await;
        slots.release().await;

        let failure = match result {
            Ok(response) if response.is_success() => {
                probe.disarm();
                if let Some(breaker) = &breaker
                    && let Err(e) = breaker.record_success().await
                {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to record breaker success");
                }
                tracing::info!(job_id = %job.id, status = response.status, "Job completed");
                return match self.store.complete(job.id, token, JobStatus::Completed).await {
                    Ok(()) => Outcome::Completed,
                    Err(e) => Self::abandon(&job, e),
                };
            }
            Ok(response) => AppError::Endpoint {
                status: response.status,
                snippet: response.body_snippet,
            },
            Err(e) => e,
        };

        self.handle_failure(&mut job, token, breaker.as_ref(), probe, group.as_ref(), failure)
            .await
    }

    /// Resolve the job's URL group, falling back to the queue's binding.
    /// A dangling reference is a fatal configuration error.
    async fn resolve_group(
        &self,
        job: &Job,
        queue: Option<&QueueConfig>,
    ) -> Result<Option<UrlGroup>, AppError> {
        let group_id = job
            .url_group_id
            .clone()
            .or_else(|| queue.and_then(|q| q.url_group_id.clone()));
        let Some(group_id) = group_id else {
            return Ok(None);
        };
        match self.resolver.url_group(&group_id).await? {
            Some(group) => Ok(Some(group)),
            None => Err(AppError::Configuration(format!(
                "URL group '{group_id}' does not exist"
            ))),
        }
    }

    async fn check_rate_limits(
        &self,
        job: &Job,
        queue: Option<&QueueConfig>,
        group: Option<&UrlGroup>,
    ) -> Result<Option<(Scope, Duration)>, AppError> {
        let tenant = self.resolver.tenant(&job.tenant_id).await?;

        let mut checks: Vec<(Scope, RateLimitPolicy)> = Vec::new();
        if let Some(policy) = tenant.and_then(|t| t.rate_limit) {
            checks.push((Scope::Tenant(job.tenant_id.clone()), policy));
        }
        if let Some(policy) = queue.and_then(|q| q.rate_limit) {
            checks.push((
                Scope::Queue {
                    tenant_id: job.tenant_id.clone(),
                    queue_id: job.queue_id.clone(),
                },
                policy,
            ));
        }
        if let Some(group) = group
            && let Some(policy) = group.rate_limit
        {
            checks.push((Scope::UrlGroup(group.group_id.clone()), policy));
        }

        for (scope, policy) in checks {
            match self.limiter.try_acquire(&scope, &policy).await? {
                RateDecision::Allowed => {}
                RateDecision::Denied { retry_after } => return Ok(Some((scope, retry_after))),
            }
        }
        Ok(None)
    }

    /// Take queue and group concurrency slots. On a partial acquisition
    /// the already-held slots are released before reporting denial.
    async fn acquire_slots(
        &self,
        queue: Option<&QueueConfig>,
        group: Option<&UrlGroup>,
    ) -> Result<Option<SlotGuard<SL>>, AppError> {
        let mut wanted: Vec<(String, u32)> = Vec::new();
        if let Some(queue) = queue
            && let Some(max) = queue.max_concurrency
        {
            wanted.push((
                format!("cc:queue:{}:{}", queue.tenant_id, queue.queue_id),
                max,
            ));
        }
        if let Some(group) = group
            && let Some(max) = group.concurrent_requests
        {
            wanted.push((format!("cc:group:{}", group.group_id), max));
        }

        let mut guard = SlotGuard {
            slots: self.slots.clone(),
            held: Vec::new(),
        };
        for (key, max) in wanted {
            match self.slots.try_acquire(&key, max).await {
                Ok(true) => guard.held.push(key),
                Ok(false) => {
                    guard.release().await;
                    return Ok(None);
                }
                Err(e) => {
                    guard.release().await;
                    return Err(e);
                }
            }
        }
        Ok(Some(guard))
    }

    /// Reschedule without touching `retries_left` or the error log.
    async fn reschedule_for_free(
        &self,
        job: &Job,
        token: &LeaseToken,
        retry_after: Duration,
        outcome: impl FnOnce(Duration) -> Outcome,
    ) -> Outcome {
        let next = Utc::now() + chrono::TimeDelta::from_std(retry_after).unwrap_or_default();
        match self.store.reenqueue(job.id, token, job, next).await {
            Ok(()) => outcome(retry_after),
            Err(e) => Self::abandon(job, e),
        }
    }

    /// Fatal, non-retryable error: log it on the job and dead-letter.
    async fn fail_fatal(&self, job: &mut Job, token: &LeaseToken, error: AppError) -> Outcome {
        tracing::warn!(job_id = %job.id, error = %error, "Fatal job error, dead-lettering");
        job.record_error(error.to_string(), error.status_code(), None);
        match self.store.dead_letter(job.id, token, job).await {
            Ok(()) => Outcome::DeadLettered,
            Err(e) => Self::abandon(job, e),
        }
    }

    /// Execution failure: record it, feed the breaker, and let the retry
    /// scheduler pick re-enqueue or dead-letter.
    async fn handle_failure(
        &self,
        job: &mut Job,
        token: &LeaseToken,
        breaker: Option<&CircuitBreaker<B>>,
        probe: ProbeGuard<B>,
        group: Option<&UrlGroup>,
        failure: AppError,
    ) -> Outcome {
        let snippet = match &failure {
            AppError::Endpoint { snippet, .. } if !snippet.is_empty() => Some(snippet.clone()),
            _ => None,
        };
        job.record_error(failure.to_string(), failure.status_code(), snippet);

        if failure.should_trip_circuit()
            && let Some(breaker) = breaker
        {
            // The recorded failure resolves the probe (half-open goes
            // back to open and zeroes the in-flight count).
            probe.disarm();
            if let Err(e) = breaker.record_failure(&failure).await {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to record breaker failure");
            }
        } else {
            // Non-tripping failures never reach the breaker; hand the
            // probe slot back so the circuit cannot wedge half-open.
            probe.give_back().await;
        }

        let policy = group.map(|g| g.retry.clone()).unwrap_or_else(RetryPolicy::default);
        match schedule(job, &failure, &policy) {
            RetryDecision::Reenqueue(next) => {
                job.retries_left -= 1;
                tracing::warn!(
                    job_id = %job.id,
                    error = %failure,
                    retries_left = job.retries_left,
                    next_execution = %next,
                    "Job failed, retrying"
                );
                match self.store.reenqueue(job.id, token, job, next).await {
                    Ok(()) => Outcome::Reenqueued {
                        next_execution: next,
                    },
                    Err(e) => Self::abandon(job, e),
                }
            }
            RetryDecision::DeadLetter => {
                tracing::warn!(job_id = %job.id, error = %failure, "Job exhausted, dead-lettering");
                match self.store.dead_letter(job.id, token, job).await {
                    Ok(()) => Outcome::DeadLettered,
                    Err(e) => Self::abandon(job, e),
                }
            }
        }
    }

    async fn finish_cancelled(&self, job: &Job, token: &LeaseToken) -> Outcome {
        tracing::info!(job_id = %job.id, "Job cancelled, aborting without retry cost");
        match self.store.complete(job.id, token, JobStatus::Cancelled).await {
            Ok(()) => Outcome::Cancelled,
            Err(e) => Self::abandon(job, e),
        }
    }

    /// Store unavailability: leave the lease to expire rather than risk
    /// a write with an uncertain outcome.
    fn abandon(job: &Job, error: AppError) -> Outcome {
        tracing::error!(job_id = %job.id, error = %error, "Store failure, abandoning claim");
        Outcome::Abandoned {
            reason: error.to_string(),
        }
    }
}

/// Concurrency slots held for one dispatch. Normally released right
/// after the dispatch returns; if the processing future is torn down
/// mid-flight (a lost lease drops it at an await point), `Drop` hands
/// the slots back so the scope's capacity is never stranded.
struct SlotGuard<SL: ConcurrencySlots> {
    slots: SL,
    held: Vec<String>,
}

impl<SL: ConcurrencySlots> SlotGuard<SL> {
    async fn release(mut self) {
        let held = std::mem::take(&mut self.held);
        release_slot_keys(&self.slots, &held).await;
    }
}

impl<SL: ConcurrencySlots> Drop for SlotGuard<SL> {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let slots = self.slots.clone();
        let held = std::mem::take(&mut self.held);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                release_slot_keys(&slots, &held).await;
            });
        }
    }
}

async fn release_slot_keys<SL: ConcurrencySlots>(slots: &SL, held: &[String]) {
    for key in held {
        if let Err(e) = slots.release(key).await {
            tracing::warn!(key = %key, error = %e, "Failed to release concurrency slot");
        }
    }
}

/// Half-open probe slot taken at admission. The slot is resolved by
/// `record_success`/`record_failure`; any attempt that ends without
/// reaching the breaker must give it back instead, including a future
/// dropped mid-dispatch.
struct ProbeGuard<B: BreakerStore> {
    breaker: Option<CircuitBreaker<B>>,
}

impl<B: BreakerStore> ProbeGuard<B> {
    fn none() -> Self {
        Self { breaker: None }
    }

    fn armed(breaker: CircuitBreaker<B>) -> Self {
        Self {
            breaker: Some(breaker),
        }
    }

    /// The breaker recorded an outcome for this probe.
    fn disarm(mut self) {
        self.breaker = None;
    }

    /// Return an unresolved probe slot.
    async fn give_back(mut self) {
        if let Some(breaker) = self.breaker.take()
            && let Err(e) = breaker.release_probe().await
        {
            tracing::warn!(group = breaker.group_id(), error = %e, "Failed to release probe slot");
        }
    }
}

impl<B: BreakerStore> Drop for ProbeGuard<B> {
    fn drop(&mut self) {
        let Some(breaker) = self.breaker.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = breaker.release_probe().await {
                    tracing::warn!(group = breaker.group_id(), error = %e, "Failed to release probe slot");
                }
            });
        }
    }
}

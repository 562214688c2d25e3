//! Retry scheduling: exponential backoff with jitter.
//!
//! Turns a failed attempt into either a re-enqueue time or a dead-letter
//! decision. The scheduler is pure over the job's counters; the processor
//! applies the decision (decrementing `retries_left`, persisting state).

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::job::Job;

/// Exponential backoff policy, from the URL group (or defaults).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Uniform random jitter added on top of the computed delay, as a
    /// fraction of it: `[0, jitter_factor] * delay`. Zero disables jitter.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for a zero-indexed attempt:
    /// `min(initial_delay * 2^attempt, max_delay)` plus jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        let capped = std::cmp::min(base, self.max_delay);
        if self.jitter_factor <= 0.0 {
            return capped;
        }
        let jitter = capped.mul_f64(self.jitter_factor * uniform_unit());
        capped + jitter
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back on the queue, due at the given time. The caller
    /// decrements `retries_left`.
    Reenqueue(DateTime<Utc>),
    /// The job is exhausted or the failure is not retryable; freeze it on
    /// the dead-letter list.
    DeadLetter,
}

/// Decide re-enqueue vs. dead-letter for a failed attempt.
///
/// Only retryable failures consume a retry; non-retryable failures and
/// jobs with no retries left dead-letter immediately.
pub fn schedule(job: &Job, failure: &AppError, policy: &RetryPolicy) -> RetryDecision {
    if !failure.is_retryable() || job.retries_left == 0 {
        return RetryDecision::DeadLetter;
    }
    let delay = policy.delay_for_attempt(job.attempt());
    RetryDecision::Reenqueue(Utc::now() + delay)
}

// ---------------------------------------------------------------------------
// Jitter from a time-seeded xorshift - random enough for backoff spreading
// without pulling in the `rand` crate.
// ---------------------------------------------------------------------------

fn uniform_unit() -> f64 {
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    (x % 10_000) as f64 / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CreateJobRequest;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(60));
    }

    #[test]
    fn extreme_attempt_numbers_stay_capped() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay_for_attempt(0);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_secs(6));
        }
    }

    #[test]
    fn retryable_failure_reenqueues_with_backoff() {
        let mut job = CreateJobRequest::new("acme", "default", "https://example.com", "POST")
            .with_max_retries(3)
            .into_job();
        job.retries_left = 2; // attempt 1 -> 2s delay

        let before = Utc::now();
        let decision = schedule(&job, &AppError::Timeout(30), &no_jitter());
        match decision {
            RetryDecision::Reenqueue(next) => {
                let delta = next - before;
                assert!(delta >= chrono::TimeDelta::seconds(2));
                assert!(delta < chrono::TimeDelta::seconds(4));
            }
            RetryDecision::DeadLetter => panic!("retryable failure with retries left"),
        }
    }

    #[test]
    fn exhausted_job_dead_letters() {
        let mut job =
            CreateJobRequest::new("acme", "default", "https://example.com", "POST").into_job();
        job.retries_left = 0;
        assert_eq!(
            schedule(&job, &AppError::Timeout(30), &no_jitter()),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn non_retryable_failure_dead_letters_with_retries_left() {
        let job = CreateJobRequest::new("acme", "default", "https://example.com", "POST")
            .with_max_retries(5)
            .into_job();
        let failure = AppError::Endpoint {
            status: 404,
            snippet: "not found".into(),
        };
        assert_eq!(
            schedule(&job, &failure, &no_jitter()),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn reenqueue_time_is_in_the_future() {
        let job = CreateJobRequest::new("acme", "default", "https://example.com", "POST")
            .with_max_retries(3)
            .into_job();
        match schedule(&job, &AppError::Network("reset".into()), &no_jitter()) {
            RetryDecision::Reenqueue(next) => assert!(next > Utc::now()),
            RetryDecision::DeadLetter => panic!("expected reenqueue"),
        }
    }
}

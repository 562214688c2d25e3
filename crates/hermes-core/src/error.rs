use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Hermes.
///
/// Every failure a job can observe during an attempt maps onto exactly one
/// variant, and the processor decides retry vs. dead-letter by matching on
/// the classifiers below rather than on ad-hoc strings.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or invalid tenant/queue/URL-group configuration. Fatal for
    /// the job, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Request signing failed (bad key material). Fatal, never retried.
    #[error("Signing error: {0}")]
    Signing(String),

    /// A rate-limit scope denied the dispatch. Transient, reschedule
    /// without consuming a retry.
    #[error("Rate limited on scope '{scope}', retry in {}s", retry_after.as_secs())]
    RateLimited { scope: String, retry_after: Duration },

    /// The URL group's circuit breaker is open. Transient, reschedule
    /// without consuming a retry.
    #[error("Circuit open for group '{group}', retry in {}s", retry_after.as_secs())]
    CircuitOpen { group: String, retry_after: Duration },

    /// The endpoint answered with a non-2xx status.
    #[error("Endpoint returned HTTP {status}: {snippet}")]
    Endpoint { status: u16, snippet: String },

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    Network(String),

    /// The worker's lease on the job expired or was lost mid-attempt.
    #[error("Lease expired or lost")]
    LeaseExpired,

    /// Backing store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    ///
    /// 429 and 5xx responses, timeouts, network faults, and interrupted
    /// leases consume a retry; everything else is either fatal (config,
    /// signing, 4xx caller errors) or rescheduled for free (rate limit,
    /// open circuit).
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Network(_) | AppError::Timeout(_) | AppError::LeaseExpired => true,
            AppError::Endpoint { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Returns true if this error should count as a failure against the
    /// target's circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::Network(_) | AppError::Timeout(_) => true,
            AppError::Endpoint { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Status code of the endpoint response, when there was one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::Endpoint { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod job;
pub mod processor;
pub mod queue_store;
pub mod rate_limit;
pub mod request;
pub mod retry;
pub mod signing;
pub mod worker;

#[cfg(test)]
pub mod testutil;

pub use circuit_breaker::{Admission, BreakerPolicy, BreakerSnapshot, BreakerStore, CircuitBreaker, CircuitState};
pub use config::{ConfigResolver, QueueConfig, TenantConfig, UrlGroup};
pub use error::AppError;
pub use job::{CreateJobRequest, Job, JobStatus, WorkerConfig};
pub use processor::{JobProcessor, Outcome};
pub use queue_store::{LeaseToken, QueueStore};
pub use rate_limit::{ConcurrencySlots, RateCounterStore, RateLimiter, RateLimitPolicy, Scope};
pub use request::{HttpDispatcher, HttpResponse, PreparedRequest};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{QueueAssignment, WorkerPool, WorkerReporter, WorkerService};

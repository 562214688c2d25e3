//! Shared test doubles. Compiled only for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::circuit_breaker::InMemoryBreakerStore;
use crate::error::AppError;
use crate::queue_store::InMemoryQueueStore;
use crate::rate_limit::{InMemoryCounterStore, InMemorySlots, RateLimiter};
use crate::request::{HttpDispatcher, HttpResponse, PreparedRequest};
use crate::worker::{WorkerEvent, WorkerReporter};

/// Fresh in-memory backing stores for one test.
pub fn harness() -> (
    InMemoryQueueStore,
    RateLimiter<InMemoryCounterStore>,
    InMemorySlots,
    InMemoryBreakerStore,
) {
    (
        InMemoryQueueStore::new(),
        RateLimiter::new(InMemoryCounterStore::new()),
        InMemorySlots::new(),
        InMemoryBreakerStore::new(),
    )
}

pub fn ok_response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        body_snippet: String::new(),
    }
}

/// Scripted [`HttpDispatcher`]: pops one queued result per call and
/// records every request it sees. Calls past the script fail loudly.
#[derive(Clone, Default)]
pub struct MockDispatcher {
    responses: Arc<Mutex<VecDeque<Result<HttpResponse, AppError>>>>,
    calls: Arc<Mutex<Vec<PreparedRequest>>>,
    latency: Option<Duration>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<HttpResponse, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            calls: Arc::new(Mutex::new(Vec::new())),
            latency: None,
        }
    }

    /// Delay each dispatch, for tests exercising timing behavior.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<PreparedRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl HttpDispatcher for MockDispatcher {
    async fn execute(&self, request: &PreparedRequest) -> Result<HttpResponse, AppError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self
            .responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Err(AppError::Network("mock dispatcher script exhausted".into())))
    }
}

/// Reporter that records every `(worker_id, event)` pair.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<(String, WorkerEvent)>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, WorkerEvent)> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, worker_id: &str, event: &WorkerEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((worker_id.to_string(), event.clone()));
    }
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// One entry in a job's append-only error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
    pub status_code: Option<u16>,
    pub response_snippet: Option<String>,
}

/// A scheduled HTTP call with execution and retry metadata.
///
/// Mutated exclusively by the processor and retry scheduler while the
/// owning worker holds a lease. `retries_left` only ever decreases and
/// `error_log` is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub queue_id: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout_secs: u64,
    pub retries_left: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub next_execution: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default)]
    pub error_log: Vec<ErrorLogEntry>,
    pub url_group_id: Option<String>,
}

impl Job {
    /// Zero-indexed attempt number: how many retryable failures this job
    /// has already consumed.
    pub fn attempt(&self) -> u32 {
        self.max_retries.saturating_sub(self.retries_left)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Append a failure to the error log without touching any other field.
    pub fn record_error(
        &mut self,
        message: impl Into<String>,
        status_code: Option<u16>,
        response_snippet: Option<String>,
    ) {
        self.error_log.push(ErrorLogEntry {
            at: Utc::now(),
            message: message.into(),
            status_code,
            response_snippet,
        });
    }
}

/// Request to enqueue a new job, produced by the management layer.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub tenant_id: String,
    pub queue_id: String,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub url_group_id: Option<String>,
}

impl CreateJobRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        queue_id: impl Into<String>,
        url: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queue_id: queue_id.into(),
            url: url.into(),
            method: method.into(),
            headers: HashMap::new(),
            body: None,
            timeout_secs: 30,
            max_retries: 3,
            url_group_id: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_url_group(mut self, group_id: impl Into<String>) -> Self {
        self.url_group_id = Some(group_id.into());
        self
    }

    /// Materialize a Pending job due immediately.
    pub fn into_job(self) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            queue_id: self.queue_id,
            url: self.url,
            method: self.method,
            headers: self.headers,
            body: self.body,
            timeout_secs: self.timeout_secs,
            retries_left: self.max_retries,
            max_retries: self.max_retries,
            created_at: now,
            next_execution: now,
            status: JobStatus::Pending,
            error_log: Vec::new(),
            url_group_id: self.url_group_id,
        }
    }
}

/// Configuration for one worker task.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    /// How long a claim stays exclusive before other workers may reclaim
    /// the job. Must comfortably exceed the largest job timeout.
    pub lease_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(120),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

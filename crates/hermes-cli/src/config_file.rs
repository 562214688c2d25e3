//! JSON configuration file for tenants, queues, and URL groups.
//!
//! The file is loaded once at startup into a [`StaticResolver`];
//! durations are plain seconds to keep the format hand-editable.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use hermes_core::circuit_breaker::BreakerPolicy;
use hermes_core::config::{AuthConfig, QueueConfig, StaticResolver, TenantConfig, UrlGroup};
use hermes_core::rate_limit::RateLimitPolicy;
use hermes_core::retry::RetryPolicy;

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub tenants: Vec<TenantEntry>,
    #[serde(default)]
    pub queues: Vec<QueueEntry>,
    #[serde(default)]
    pub url_groups: Vec<UrlGroupEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TenantEntry {
    pub tenant_id: String,
    pub rate_limit: Option<RateLimitEntry>,
}

#[derive(Debug, Deserialize)]
pub struct QueueEntry {
    pub tenant_id: String,
    pub queue_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_concurrency: Option<u32>,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    pub priority: Option<i32>,
    pub url_group_id: Option<String>,
    pub rate_limit: Option<RateLimitEntry>,
}

#[derive(Debug, Deserialize)]
pub struct UrlGroupEntry {
    pub group_id: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_headers: HashMap<String, String>,
    pub signing_key: Option<String>,
    #[serde(default)]
    pub retry: RetryEntry,
    pub rate_limit: Option<RateLimitEntry>,
    pub concurrent_requests: Option<u32>,
    #[serde(default)]
    pub ip_allowlist: Vec<IpAddr>,
    #[serde(default)]
    pub breaker: BreakerEntry,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitEntry {
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RetryEntry {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter_factor: f64,
}

impl Default for RetryEntry {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_delay_secs: policy.initial_delay.as_secs(),
            max_delay_secs: policy.max_delay.as_secs(),
            jitter_factor: policy.jitter_factor,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BreakerEntry {
    pub failure_threshold: u32,
    pub trip_duration_secs: u64,
    pub half_open_max_probes: u32,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        let policy = BreakerPolicy::default();
        Self {
            failure_threshold: policy.failure_threshold,
            trip_duration_secs: policy.trip_duration.as_secs(),
            half_open_max_probes: policy.half_open_max_probes,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

impl From<RateLimitEntry> for RateLimitPolicy {
    fn from(entry: RateLimitEntry) -> Self {
        RateLimitPolicy::new(entry.limit, Duration::from_secs(entry.window_secs.max(1)))
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw).context("Invalid JSON in config file")
    }

    pub fn into_resolver(self) -> StaticResolver {
        let tenants = self
            .tenants
            .into_iter()
            .map(|t| TenantConfig {
                tenant_id: t.tenant_id,
                rate_limit: t.rate_limit.map(Into::into),
            })
            .collect();

        let queues = self
            .queues
            .into_iter()
            .map(|q| {
                let mut queue = QueueConfig::new(q.tenant_id, q.queue_id);
                queue.enabled = q.enabled;
                queue.max_concurrency = q.max_concurrency;
                queue.default_max_retries = q.default_max_retries;
                queue.default_timeout_secs = q.default_timeout_secs;
                queue.priority = q.priority;
                queue.url_group_id = q.url_group_id;
                queue.rate_limit = q.rate_limit.map(Into::into);
                queue
            })
            .collect();

        let groups = self
            .url_groups
            .into_iter()
            .map(|g| {
                let mut group = UrlGroup::new(g.group_id);
                group.base_url = g.base_url;
                group.default_headers = g.default_headers;
                group.auth = g.signing_key.map(|signing_key| AuthConfig { signing_key });
                group.retry = RetryPolicy {
                    initial_delay: Duration::from_secs(g.retry.initial_delay_secs),
                    max_delay: Duration::from_secs(g.retry.max_delay_secs),
                    jitter_factor: g.retry.jitter_factor,
                };
                group.rate_limit = g.rate_limit.map(Into::into);
                group.concurrent_requests = g.concurrent_requests;
                group.ip_allowlist = g.ip_allowlist;
                group.breaker = BreakerPolicy {
                    failure_threshold: g.breaker.failure_threshold,
                    trip_duration: Duration::from_secs(g.breaker.trip_duration_secs),
                    half_open_max_probes: g.breaker.half_open_max_probes,
                };
                group
            })
            .collect();

        StaticResolver::new(tenants, queues, groups)
    }
}

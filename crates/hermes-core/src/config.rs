//! Tenant, queue, and URL-group configuration read by the core.
//!
//! These records are owned by the management layer; the core only ever
//! reads them. Each job execution works against the snapshot resolved at
//! dispatch time, so configuration changes apply to subsequent jobs only.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::BreakerPolicy;
use crate::error::AppError;
use crate::rate_limit::RateLimitPolicy;
use crate::retry::RetryPolicy;

/// Top-level tenant scope, carrying an optional tenant-wide rate limit.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub rate_limit: Option<RateLimitPolicy>,
}

/// Tenant-scoped execution policy container for one queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub tenant_id: String,
    pub queue_id: String,
    pub enabled: bool,
    /// Cap on jobs from this queue executing at once, across all workers.
    pub max_concurrency: Option<u32>,
    pub default_max_retries: u32,
    pub default_timeout_secs: u64,
    pub priority: Option<i32>,
    pub url_group_id: Option<String>,
    pub rate_limit: Option<RateLimitPolicy>,
}

impl QueueConfig {
    pub fn new(tenant_id: impl Into<String>, queue_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queue_id: queue_id.into(),
            enabled: true,
            max_concurrency: None,
            default_max_retries: 3,
            default_timeout_secs: 30,
            priority: None,
            url_group_id: None,
            rate_limit: None,
        }
    }
}

/// Authentication configuration for an endpoint family: requests are
/// signed with a keyed HMAC over method, URL, and body.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub signing_key: String,
}

/// Endpoint health-check settings. Read-only to the execution engine;
/// probing is driven by the management layer.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub path: String,
    pub interval: Duration,
}

/// Shared configuration for queues targeting the same endpoint family.
#[derive(Debug, Clone)]
pub struct UrlGroup {
    pub group_id: String,
    /// Base URL joined with relative job URLs.
    pub base_url: Option<String>,
    /// Headers applied to every request; job headers take precedence.
    pub default_headers: HashMap<String, String>,
    pub auth: Option<AuthConfig>,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimitPolicy>,
    /// Cap on in-flight requests to this endpoint family.
    pub concurrent_requests: Option<u32>,
    /// When non-empty, the endpoint host must resolve to one of these.
    pub ip_allowlist: Vec<IpAddr>,
    pub breaker: BreakerPolicy,
    pub health_check: Option<HealthCheckConfig>,
}

impl UrlGroup {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            base_url: None,
            default_headers: HashMap::new(),
            auth: None,
            retry: RetryPolicy::default(),
            rate_limit: None,
            concurrent_requests: None,
            ip_allowlist: Vec::new(),
            breaker: BreakerPolicy::default(),
            health_check: None,
        }
    }
}

/// Read-only access to tenant/queue/URL-group records.
///
/// Implementations live at the management boundary (database, config
/// service); [`StaticResolver`] serves fixed in-memory records for
/// single-process deployments and tests.
pub trait ConfigResolver: Send + Sync + Clone {
    fn tenant(
        &self,
        tenant_id: &str,
    ) -> impl Future<Output = Result<Option<TenantConfig>, AppError>> + Send;

    fn queue(
        &self,
        tenant_id: &str,
        queue_id: &str,
    ) -> impl Future<Output = Result<Option<QueueConfig>, AppError>> + Send;

    fn url_group(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<Option<UrlGroup>, AppError>> + Send;
}

/// Fixed in-memory resolver.
#[derive(Clone, Default)]
pub struct StaticResolver {
    tenants: Arc<HashMap<String, TenantConfig>>,
    queues: Arc<HashMap<(String, String), QueueConfig>>,
    groups: Arc<HashMap<String, UrlGroup>>,
}

impl StaticResolver {
    pub fn new(
        tenants: Vec<TenantConfig>,
        queues: Vec<QueueConfig>,
        groups: Vec<UrlGroup>,
    ) -> Self {
        Self {
            tenants: Arc::new(
                tenants
                    .into_iter()
                    .map(|t| (t.tenant_id.clone(), t))
                    .collect(),
            ),
            queues: Arc::new(
                queues
                    .into_iter()
                    .map(|q| ((q.tenant_id.clone(), q.queue_id.clone()), q))
                    .collect(),
            ),
            groups: Arc::new(
                groups
                    .into_iter()
                    .map(|g| (g.group_id.clone(), g))
                    .collect(),
            ),
        }
    }
}

impl ConfigResolver for StaticResolver {
    async fn tenant(&self, tenant_id: &str) -> Result<Option<TenantConfig>, AppError> {
        Ok(self.tenants.get(tenant_id).cloned())
    }

    async fn queue(&self, tenant_id: &str, queue_id: &str) -> Result<Option<QueueConfig>, AppError> {
        Ok(self
            .queues
            .get(&(tenant_id.to_string(), queue_id.to_string()))
            .cloned())
    }

    async fn url_group(&self, group_id: &str) -> Result<Option<UrlGroup>, AppError> {
        Ok(self.groups.get(group_id).cloned())
    }
}

/// Caching wrapper around any [`ConfigResolver`].
///
/// Workers resolve the same tenant/queue/group records on every job; the
/// TTL bounds how stale a dispatch-time snapshot can be.
#[derive(Clone)]
pub struct CachedResolver<R: ConfigResolver> {
    inner: R,
    tenants: moka::future::Cache<String, Option<TenantConfig>>,
    queues: moka::future::Cache<(String, String), Option<QueueConfig>>,
    groups: moka::future::Cache<String, Option<UrlGroup>>,
}

impl<R: ConfigResolver + 'static> CachedResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            tenants: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            queues: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            groups: moka::future::Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl<R: ConfigResolver + 'static> ConfigResolver for CachedResolver<R> {
    async fn tenant(&self, tenant_id: &str) -> Result<Option<TenantConfig>, AppError> {
        let inner = self.inner.clone();
        let key = tenant_id.to_string();
        self.tenants
            .try_get_with(key.clone(), async move { inner.tenant(&key).await })
            .await
            .map_err(|e| AppError::Store(e.to_string()))
    }

    async fn queue(&self, tenant_id: &str, queue_id: &str) -> Result<Option<QueueConfig>, AppError> {
        let inner = self.inner.clone();
        let key = (tenant_id.to_string(), queue_id.to_string());
        self.queues
            .try_get_with(key.clone(), async move { inner.queue(&key.0, &key.1).await })
            .await
            .map_err(|e| AppError::Store(e.to_string()))
    }

    async fn url_group(&self, group_id: &str) -> Result<Option<UrlGroup>, AppError> {
        let inner = self.inner.clone();
        let key = group_id.to_string();
        self.groups
            .try_get_with(key.clone(), async move { inner.url_group(&key).await })
            .await
            .map_err(|e| AppError::Store(e.to_string()))
    }
}

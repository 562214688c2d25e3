use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use hermes_core::error::AppError;
use hermes_core::job::{CreateJobRequest, ErrorLogEntry, Job, JobStatus};
use hermes_core::queue_store::{LeaseToken, QueueStore};

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
///
/// Leases are a `(lease_token, lease_expires_at)` pair on the row; every
/// mutation is guarded by `lease_token = $token AND lease_expires_at >
/// NOW()`, so a worker whose lease lapsed gets zero rows affected and a
/// [`AppError::LeaseExpired`].
#[derive(Clone)]
pub struct PgQueueStore {
    pool: Pool<Postgres>,
}

impl PgQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Return jobs whose lease lapsed to pending, charging a retry; jobs
    /// with none left go straight to failed.
    async fn reclaim_expired(&self, tenant_id: &str, queue_id: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = CASE WHEN retries_left > 0 THEN 'pending' ELSE 'failed' END,
                retries_left = GREATEST(retries_left - 1, 0),
                next_execution = NOW(),
                error_log = error_log || jsonb_build_array(jsonb_build_object(
                    'at', to_char(NOW() AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.US"Z"'),
                    'message', 'job lease expired before a decision was recorded',
                    'status_code', NULL,
                    'response_snippet', NULL
                )),
                lease_token = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM jobs
                WHERE tenant_id = $1 AND queue_id = $2
                  AND status = 'in_progress' AND lease_expires_at <= NOW()
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(tenant_id)
        .bind(queue_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        if result.rows_affected() > 0 {
            tracing::warn!(
                tenant = tenant_id,
                queue = queue_id,
                reclaimed = result.rows_affected(),
                "Reclaimed jobs with expired leases"
            );
        }
        Ok(())
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    tenant_id: String,
    queue_id: String,
    url: String,
    method: String,
    headers: serde_json::Value,
    body: Option<String>,
    timeout_secs: i64,
    retries_left: i32,
    max_retries: i32,
    created_at: DateTime<Utc>,
    next_execution: DateTime<Utc>,
    status: String,
    error_log: serde_json::Value,
    url_group_id: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        let headers: HashMap<String, String> =
            serde_json::from_value(row.headers).unwrap_or_default();
        let error_log: Vec<ErrorLogEntry> =
            serde_json::from_value(row.error_log).unwrap_or_default();
        Job {
            id: row.id,
            tenant_id: row.tenant_id,
            queue_id: row.queue_id,
            url: row.url,
            method: row.method,
            headers,
            body: row.body,
            timeout_secs: row.timeout_secs.max(0) as u64,
            retries_left: row.retries_left.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            created_at: row.created_at,
            next_execution: row.next_execution,
            status: row.status.parse().unwrap_or(JobStatus::Pending),
            error_log,
            url_group_id: row.url_group_id,
        }
    }
}

impl QueueStore for PgQueueStore {
    async fn enqueue(&self, request: CreateJobRequest) -> Result<Job, AppError> {
        let headers = serde_json::to_value(&request.headers)?;
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (
                tenant_id, queue_id, url, method, headers, body,
                timeout_secs, retries_left, max_retries, url_group_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9)
            RETURNING *
            "#,
        )
        .bind(&request.tenant_id)
        .bind(&request.queue_id)
        .bind(&request.url)
        .bind(&request.method)
        .bind(&headers)
        .bind(&request.body)
        .bind(request.timeout_secs as i64)
        .bind(request.max_retries as i32)
        .bind(&request.url_group_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(row.into())
    }

    async fn claim_next(
        &self,
        tenant_id: &str,
        queue_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<(Job, LeaseToken)>, AppError> {
        self.reclaim_expired(tenant_id, queue_id).await?;

        let token = LeaseToken::new();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'in_progress',
                lease_token = $3,
                lease_expires_at = NOW() + make_interval(secs => $4),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE tenant_id = $1 AND queue_id = $2
                  AND status = 'pending' AND next_execution <= NOW()
                ORDER BY next_execution ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(queue_id)
        .bind(token.as_uuid())
        .bind(lease_ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(row.map(|r| (r.into(), token)))
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        lease_ttl: Duration,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + make_interval(secs => $3), updated_at = NOW()
            WHERE id = $1 AND lease_token = $2 AND lease_expires_at > NOW()
            "#,
        )
        .bind(job_id)
        .bind(token.as_uuid())
        .bind(lease_ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseExpired);
        }
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        status: JobStatus,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN status = 'cancelled' THEN 'cancelled' ELSE $3 END,
                lease_token = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND lease_token = $2 AND lease_expires_at > NOW()
            "#,
        )
        .bind(job_id)
        .bind(token.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseExpired);
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
        let error_log = serde_json::to_value(&job.error_log)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN status = 'cancelled' THEN 'cancelled' ELSE 'pending' END,
                retries_left = $3,
                error_log = $4,
                next_execution = $5,
                lease_token = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND lease_token = $2 AND lease_expires_at > NOW()
            "#,
        )
        .bind(job_id)
        .bind(token.as_uuid())
        .bind(job.retries_left as i32)
        .bind(&error_log)
        .bind(next_execution)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseExpired);
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        job_id: Uuid,
        token: &LeaseToken,
        job: &Job,
    ) -> Result<(), AppError> {
        let error_log = serde_json::to_value(&job.error_log)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN status = 'cancelled' THEN 'cancelled' ELSE 'failed' END,
                retries_left = $3,
                error_log = $4,
                lease_token = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND lease_token = $2 AND lease_expires_at > NOW()
            "#,
        )
        .bind(job_id)
        .bind(token.as_uuid())
        .bind(job.retries_left as i32)
        .bind(&error_log)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::LeaseExpired);
        }
        Ok(())
    }

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, AppError> {
        let (cancelled,): (bool,) = sqlx::query_as(
            r#"SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1 AND status = 'cancelled')"#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(cancelled)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(r#"SELECT * FROM jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list_dead_letters(&self, tenant_id: &str, limit: usize) -> Result<Vec<Job>, AppError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE tenant_id = $1 AND status = 'failed'
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

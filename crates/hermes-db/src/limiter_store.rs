use std::time::Duration;

use sqlx::{PgPool, Pool, Postgres};

use hermes_core::error::AppError;
use hermes_core::rate_limit::{ConcurrencySlots, RateCounterStore};

/// PostgreSQL-backed rate counters and concurrency slots.
///
/// Both stores are single-statement upserts, so increments stay atomic
/// across any number of worker processes sharing the pool.
#[derive(Clone)]
pub struct PgLimiterStore {
    pool: Pool<Postgres>,
}

impl PgLimiterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl RateCounterStore for PgLimiterStore {
    async fn increment_and_get(&self, key: &str, window: Duration) -> Result<u64, AppError> {
        // Purge lapsed buckets in the same statement; bucket keys are
        // time-suffixed, so old rows are never read again, only dropped.
        let (count,): (i64,) = sqlx::query_as(
            r#"
            WITH purge AS (
                DELETE FROM rate_counters WHERE expires_at <= NOW()
            )
            INSERT INTO rate_counters (key, count, expires_at)
            VALUES ($1, 1, NOW() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE SET count = rate_counters.count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(window.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(count.max(0) as u64)
    }
}

impl ConcurrencySlots for PgLimiterStore {
    async fn try_acquire(&self, key: &str, max: u32) -> Result<bool, AppError> {
        // The conditional upsert returns no row when the cap is reached.
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            INSERT INTO concurrency_slots (key, held)
            VALUES ($1, 1)
            ON CONFLICT (key) DO UPDATE
                SET held = concurrency_slots.held + 1
                WHERE concurrency_slots.held < $2
            RETURNING held
            "#,
        )
        .bind(key)
        .bind(max as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(row.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE concurrency_slots
            SET held = GREATEST(held - 1, 0)
            WHERE key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(())
    }
}

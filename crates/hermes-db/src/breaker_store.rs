use sqlx::{PgPool, Pool, Postgres};

use hermes_core::circuit_breaker::{BreakerSnapshot, BreakerStore};
use hermes_core::error::AppError;

/// PostgreSQL-backed breaker snapshots, one JSONB row per URL group.
///
/// Rows are created lazily: an unknown group reads as the default
/// (closed) snapshot, and the first compare-and-set from that default
/// inserts the row.
#[derive(Clone)]
pub struct PgBreakerStore {
    pool: Pool<Postgres>,
}

impl PgBreakerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl BreakerStore for PgBreakerStore {
    async fn get(&self, key: &str) -> Result<BreakerSnapshot, AppError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as(r#"SELECT snapshot FROM breakers WHERE group_id = $1"#)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::Store(e.to_string()))?;

        match row {
            Some((value,)) => Ok(serde_json::from_value(value)?),
            None => Ok(BreakerSnapshot::default()),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &BreakerSnapshot,
        new: &BreakerSnapshot,
    ) -> Result<bool, AppError> {
        let expected_json = serde_json::to_value(expected)?;
        let new_json = serde_json::to_value(new)?;

        // A default expectation must also cover the missing-row case; any
        // other expectation refers to a row that has to exist already.
        let result = if *expected == BreakerSnapshot::default() {
            sqlx::query(
                r#"
                INSERT INTO breakers (group_id, snapshot)
                VALUES ($1, $3)
                ON CONFLICT (group_id) DO UPDATE
                    SET snapshot = $3
                    WHERE breakers.snapshot = $2
                "#,
            )
            .bind(key)
            .bind(&expected_json)
            .bind(&new_json)
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE breakers
                SET snapshot = $3
                WHERE group_id = $1 AND snapshot = $2
                "#,
            )
            .bind(key)
            .bind(&expected_json)
            .bind(&new_json)
            .execute(&self.pool)
            .await
        }
        .map_err(|e| AppError::Store(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

use hermes_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::breaker_store::PgBreakerStore;
use crate::config::DatabaseConfig;
use crate::limiter_store::PgLimiterStore;
use crate::queue_store::PgQueueStore;

/// Central database facade — owns the connection pool, runs migrations,
/// and vends store instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::Store(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Store(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get a [`PgQueueStore`] backed by this pool.
    pub fn queue_store(&self) -> PgQueueStore {
        PgQueueStore::new(self.pool.clone())
    }

    /// Get a [`PgLimiterStore`] backed by this pool.
    pub fn limiter_store(&self) -> PgLimiterStore {
        PgLimiterStore::new(self.pool.clone())
    }

    /// Get a [`PgBreakerStore`] backed by this pool.
    pub fn breaker_store(&self) -> PgBreakerStore {
        PgBreakerStore::new(self.pool.clone())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

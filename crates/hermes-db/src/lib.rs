pub mod breaker_store;
pub mod config;
pub mod database;
pub mod limiter_store;
pub mod queue_store;

pub use breaker_store::PgBreakerStore;
pub use config::DatabaseConfig;
pub use database::Database;
pub use limiter_store::PgLimiterStore;
pub use queue_store::PgQueueStore;

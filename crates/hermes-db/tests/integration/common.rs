use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// SQL migration statements, executed one at a time.
const MIGRATIONS: &[&str] = &[
    // 001_jobs.sql
    r#"CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        tenant_id VARCHAR NOT NULL,
        queue_id VARCHAR NOT NULL,
        url VARCHAR NOT NULL,
        method VARCHAR(10) NOT NULL,
        headers JSONB NOT NULL DEFAULT '{}'::jsonb,
        body TEXT,
        timeout_secs BIGINT NOT NULL DEFAULT 30,
        retries_left INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        next_execution TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        error_log JSONB NOT NULL DEFAULT '[]'::jsonb,
        url_group_id VARCHAR,
        lease_token UUID,
        lease_expires_at TIMESTAMPTZ,
        CONSTRAINT chk_jobs_status CHECK (
            status IN ('pending', 'in_progress', 'completed', 'failed', 'cancelled')
        )
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_due
        ON jobs(tenant_id, queue_id, next_execution) WHERE status = 'pending'"#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_lease
        ON jobs(lease_expires_at) WHERE status = 'in_progress'"#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_dead
        ON jobs(tenant_id, updated_at DESC) WHERE status = 'failed'"#,
    // 002_limits.sql
    r#"CREATE TABLE IF NOT EXISTS rate_counters (
        key VARCHAR PRIMARY KEY,
        count BIGINT NOT NULL DEFAULT 0,
        expires_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS concurrency_slots (
        key VARCHAR PRIMARY KEY,
        held INTEGER NOT NULL DEFAULT 0
    )"#,
    // 003_breakers.sql
    r#"CREATE TABLE IF NOT EXISTS breakers (
        group_id VARCHAR PRIMARY KEY,
        snapshot JSONB NOT NULL
    )"#,
];

/// Spins up a PostgreSQL container and returns a connected pool.
///
/// The `ContainerAsync` must be kept in scope for the test duration —
/// dropping it will stop the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "hermes_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/hermes_test");

    // Retry connection until container is fully ready
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    // Run migrations one statement at a time
    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    (pool, container)
}

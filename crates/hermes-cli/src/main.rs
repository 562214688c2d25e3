mod config_file;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hermes_client::ReqwestDispatcher;
use hermes_core::config::{ConfigResolver, StaticResolver};
use hermes_core::job::{CreateJobRequest, WorkerConfig};
use hermes_core::processor::JobProcessor;
use hermes_core::queue_store::QueueStore;
use hermes_core::rate_limit::RateLimiter;
use hermes_core::worker::{QueueAssignment, TracingWorkerReporter, WorkerPool, WorkerService};
use hermes_db::{Database, DatabaseConfig};

use config_file::ConfigFile;

#[derive(Parser)]
#[command(name = "hermes", version, about = "Multi-tenant HTTP job engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker pool draining the given queues
    Work {
        /// Tenant/queue pair to drain, as "tenant:queue" (repeatable)
        #[arg(short, long = "queue", required = true)]
        queues: Vec<String>,

        /// Path to the JSON config file with tenants, queues, and URL groups
        #[arg(short, long, env = "HERMES_CONFIG")]
        config: Option<PathBuf>,

        /// Number of concurrent workers
        #[arg(short, long, env = "HERMES_WORKERS", default_value_t = 4)]
        workers: usize,

        /// Seconds between polls of an idle queue
        #[arg(long, env = "HERMES_POLL_INTERVAL_SECS", default_value_t = 5)]
        poll_interval_secs: u64,

        /// Seconds a claim stays exclusive without renewal
        #[arg(long, env = "HERMES_LEASE_TTL_SECS", default_value_t = 120)]
        lease_ttl_secs: u64,

        /// Allow dispatch to private/reserved IPs (trusted networks only)
        #[arg(long, default_value_t = false)]
        allow_private_urls: bool,
    },

    /// Enqueue a job
    Enqueue {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        queue: String,

        /// Target URL (absolute, or relative to the URL group's base)
        #[arg(short, long)]
        url: String,

        #[arg(short, long, default_value = "POST")]
        method: String,

        /// Request header as "name: value" (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        #[arg(short, long)]
        body: Option<String>,

        /// Per-attempt timeout in seconds (defaults to the queue's)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Retry budget (defaults to the queue's)
        #[arg(long)]
        max_retries: Option<u32>,

        /// URL group override for this job
        #[arg(long)]
        url_group: Option<String>,

        /// Config file consulted for queue defaults
        #[arg(short, long, env = "HERMES_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Cancel a job that has not finished yet
    Cancel {
        #[arg(short, long)]
        id: Uuid,
    },

    /// List dead-lettered jobs for a tenant
    DeadLetters {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hermes=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Work {
            queues,
            config,
            workers,
            poll_interval_secs,
            lease_ttl_secs,
            allow_private_urls,
        } => {
            let assignments = parse_assignments(&queues)?;
            let resolver = load_resolver(config.as_deref())?;
            cmd_work(
                assignments,
                resolver,
                workers,
                Duration::from_secs(poll_interval_secs),
                Duration::from_secs(lease_ttl_secs),
                allow_private_urls,
            )
            .await?;
        }
        Commands::Enqueue {
            tenant,
            queue,
            url,
            method,
            headers,
            body,
            timeout_secs,
            max_retries,
            url_group,
            config,
        } => {
            let resolver = load_resolver(config.as_deref())?;
            cmd_enqueue(
                tenant,
                queue,
                url,
                method,
                headers,
                body,
                timeout_secs,
                max_retries,
                url_group,
                resolver,
            )
            .await?;
        }
        Commands::Cancel { id } => {
            let db = connect_db().await?;
            db.queue_store().cancel(id).await?;
            tracing::info!(job_id = %id, "Cancellation requested");
        }
        Commands::DeadLetters { tenant, limit } => {
            let db = connect_db().await?;
            let dead = db.queue_store().list_dead_letters(&tenant, limit).await?;
            println!("{}", serde_json::to_string_pretty(&dead)?);
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and run migrations.
async fn connect_db() -> Result<Database> {
    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;
    Ok(db)
}

fn load_resolver(path: Option<&std::path::Path>) -> Result<StaticResolver> {
    match path {
        Some(path) => Ok(ConfigFile::load(path)?.into_resolver()),
        None => Ok(StaticResolver::default()),
    }
}

/// Parse "tenant:queue" pairs.
fn parse_assignments(raw: &[String]) -> Result<Vec<QueueAssignment>> {
    raw.iter()
        .map(|pair| match pair.split_once(':') {
            Some((tenant, queue)) if !tenant.is_empty() && !queue.is_empty() => {
                Ok(QueueAssignment::new(tenant, queue))
            }
            _ => bail!("Invalid queue '{pair}': expected \"tenant:queue\""),
        })
        .collect()
}

/// Parse a "name: value" header flag.
fn parse_header(raw: &str) -> Result<(String, String)> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("Invalid header '{raw}': expected \"name: value\""),
    }
}

async fn cmd_work(
    assignments: Vec<QueueAssignment>,
    resolver: StaticResolver,
    workers: usize,
    poll_interval: Duration,
    lease_ttl: Duration,
    allow_private_urls: bool,
) -> Result<()> {
    let db = connect_db().await?;

    let mut dispatcher = ReqwestDispatcher::new().context("Failed to create HTTP client")?;
    if allow_private_urls {
        dispatcher = dispatcher.allow_private_urls();
    }

    let processor = JobProcessor::new(
        db.queue_store(),
        resolver,
        dispatcher,
        RateLimiter::new(db.limiter_store()),
        db.limiter_store(),
        db.breaker_store(),
    );
    let worker_config = WorkerConfig::default()
        .with_poll_interval(poll_interval)
        .with_lease_ttl(lease_ttl);
    let service = WorkerService::new(
        db.queue_store(),
        processor,
        assignments,
        worker_config,
        TracingWorkerReporter,
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                cancel.cancel();
            }
        }
    });

    tracing::info!(workers, "Starting worker pool");
    WorkerPool::new(workers).run(service, cancel).await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_enqueue(
    tenant: String,
    queue: String,
    url: String,
    method: String,
    headers: Vec<String>,
    body: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    url_group: Option<String>,
    resolver: StaticResolver,
) -> Result<()> {
    let db = connect_db().await?;

    // Fall back to the queue's defaults for anything not given.
    let queue_config = resolver.queue(&tenant, &queue).await?;
    let timeout_secs = timeout_secs
        .or_else(|| queue_config.as_ref().map(|q| q.default_timeout_secs))
        .unwrap_or(30);
    let max_retries = max_retries
        .or_else(|| queue_config.as_ref().map(|q| q.default_max_retries))
        .unwrap_or(3);

    let mut request = CreateJobRequest::new(tenant, queue, url, method)
        .with_timeout(Duration::from_secs(timeout_secs))
        .with_max_retries(max_retries);
    for raw in &headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }
    if let Some(body) = body {
        request = request.with_body(body);
    }
    if let Some(group) = url_group {
        request = request.with_url_group(group);
    }

    let job = db.queue_store().enqueue(request).await?;
    tracing::info!(job_id = %job.id, "Job enqueued");
    println!("{}", job.id);
    Ok(())
}

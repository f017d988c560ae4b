//! Herald outbound webhook delivery daemon.
//!
//! Main entry point for the delivery service. Connects to PostgreSQL,
//! ensures the schema exists, and runs the retry scheduler pool until a
//! shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::{time::RealClock, Storage};
use herald_delivery::{
    ClientConfig, DeliveryClient, Dispatcher, PostgresDeliveryStorage, RetryPolicy,
    SchedulerConfig, SchedulerPool,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting herald webhook delivery daemon");

    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        worker_count = config.worker_count,
        batch_size = config.batch_size,
        poll_interval_secs = config.poll_interval.as_secs(),
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database schema ready");

    let storage = if config.allow_insecure_urls {
        warn!("endpoint URL validation accepts plain http; do not use in production");
        Storage::allowing_insecure_urls(db_pool.clone())
    } else {
        Storage::new(db_pool.clone())
    };
    storage.health_check().await.context("database health check failed")?;

    let clock = Arc::new(RealClock::new());
    let delivery_storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(storage)));
    let client = DeliveryClient::new(ClientConfig {
        timeout: config.request_timeout,
        ..ClientConfig::default()
    })
    .context("failed to build delivery HTTP client")?;

    let dispatcher = Arc::new(Dispatcher::new(
        delivery_storage.clone(),
        Arc::new(client),
        RetryPolicy::default(),
        clock.clone(),
    ));

    let scheduler_config = SchedulerConfig {
        worker_count: config.worker_count,
        batch_size: config.batch_size,
        poll_interval: config.poll_interval,
        shutdown_timeout: config.shutdown_timeout,
    };

    let mut pool = SchedulerPool::new(delivery_storage, dispatcher, scheduler_config, clock);
    pool.spawn_workers().await;
    let stats = pool.stats();

    info!(worker_count = config.worker_count, "herald is delivering");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    pool.shutdown_graceful(config.shutdown_timeout)
        .await
        .context("scheduler pool did not shut down cleanly")?;

    {
        let snapshot = stats.read().await;
        info!(
            sweeps = snapshot.sweeps,
            claimed = snapshot.claimed,
            dispatched = snapshot.dispatched,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            "final scheduler stats"
        );
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("herald shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,herald=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the herald schema exists.
///
/// Idempotent; safe to run on every startup. The attempt log carries no
/// uniqueness constraint beyond its primary key so that a manually
/// resurrected delivery can append a second life of attempt numbers.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS endpoints (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            description TEXT,
            secret TEXT NOT NULL,
            event_types TEXT[] NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT true,
            headers JSONB NOT NULL DEFAULT '{}',
            max_attempts INTEGER NOT NULL DEFAULT 10,
            timeout_seconds INTEGER NOT NULL DEFAULT 5,
            total_deliveries BIGINT NOT NULL DEFAULT 0,
            successful_deliveries BIGINT NOT NULL DEFAULT 0,
            failed_deliveries BIGINT NOT NULL DEFAULT 0,
            last_delivery_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create endpoints table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS deliveries (
            id UUID PRIMARY KEY,
            endpoint_id UUID NOT NULL,
            event_type TEXT NOT NULL,
            payload BYTEA NOT NULL,
            payload_hash TEXT NOT NULL,
            idempotency_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            next_retry_at TIMESTAMPTZ,
            last_response_status INTEGER,
            last_response_body TEXT,
            last_latency_ms BIGINT,
            error_message TEXT,
            error_category TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            first_attempt_at TIMESTAMPTZ,
            last_attempt_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create deliveries table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            delivery_id UUID NOT NULL,
            attempt_number INTEGER NOT NULL,
            request_url TEXT NOT NULL,
            request_headers JSONB NOT NULL,
            response_status INTEGER,
            response_headers JSONB,
            response_body TEXT,
            latency_ms BIGINT,
            succeeded BOOLEAN NOT NULL,
            error_message TEXT,
            error_category TEXT,
            attempted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create delivery_attempts table")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_deliveries_due
        ON deliveries(next_retry_at)
        WHERE status = 'failed'
        ",
    )
    .execute(pool)
    .await
    .context("failed to create deliveries due index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_deliveries_endpoint
        ON deliveries(endpoint_id, created_at DESC)
        ",
    )
    .execute(pool)
    .await
    .context("failed to create deliveries endpoint index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_delivery
        ON delivery_attempts(delivery_id, attempted_at)
        ",
    )
    .execute(pool)
    .await
    .context("failed to create delivery attempts index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_endpoints_event_types
        ON endpoints USING GIN (event_types)
        ",
    )
    .execute(pool)
    .await
    .context("failed to create endpoints event type index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}

/// Daemon configuration.
struct Config {
    /// PostgreSQL connection string
    database_url: String,
    /// Maximum database connections
    database_max_connections: u32,
    /// Scheduler workers to run
    worker_count: usize,
    /// Deliveries claimed per sweep
    batch_size: usize,
    /// Pause between empty sweeps
    poll_interval: Duration,
    /// Default per-request timeout; endpoints may override per delivery
    request_timeout: Duration,
    /// Grace period for workers on shutdown
    shutdown_timeout: Duration,
    /// Accept plain-http endpoint URLs (local development only)
    allow_insecure_urls: bool,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let worker_count = std::env::var("HERALD_WORKER_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(herald_delivery::DEFAULT_WORKER_COUNT);

        let batch_size = std::env::var("HERALD_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(herald_delivery::DEFAULT_BATCH_SIZE);

        let poll_interval = std::env::var("HERALD_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map_or(Duration::from_secs(1), Duration::from_secs);

        let request_timeout = std::env::var("HERALD_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map_or(Duration::from_secs(5), Duration::from_secs);

        let shutdown_timeout = std::env::var("HERALD_SHUTDOWN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map_or(Duration::from_secs(30), Duration::from_secs);

        let allow_insecure_urls = std::env::var("HERALD_ALLOW_INSECURE_URLS")
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            database_max_connections,
            worker_count,
            batch_size,
            poll_interval,
            request_timeout,
            shutdown_timeout,
            allow_insecure_urls,
        })
    }

    /// Returns database URL with password masked for logging.
    fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(password_start) = self.database_url[..at_pos].rfind(':') {
                if let Some(user_start) = self.database_url[..password_start].rfind('/') {
                    return format!(
                        "{}//{}:***@{}",
                        &self.database_url[..user_start],
                        &self.database_url[user_start + 2..password_start],
                        &self.database_url[at_pos + 1..]
                    );
                }
            }
        }
        "postgresql://***".to_string()
    }
}

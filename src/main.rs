//! hooky webhook scheduler daemon.
//!
//! Loads configuration, connects to PostgreSQL, bootstraps the schema and
//! runs the scheduler until SIGINT or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hooky_core::{storage::Storage, Clock, RealClock};
use hooky_scheduler::{HttpDispatcher, PostgresTaskStore, Scheduler};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!(
        database_url = %config.database_url_masked(),
        max_store_queries = config.max_store_queries,
        max_http_requests = config.max_http_requests,
        lease_duration_secs = config.lease_duration_secs,
        "starting hooky"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    let storage = Arc::new(Storage::new(pool.clone()));
    storage.ensure_schema().await.context("failed to bootstrap schema")?;
    info!("database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = Arc::new(PostgresTaskStore::new(storage, clock.clone()));
    let dispatcher = Arc::new(
        HttpDispatcher::new(config.to_client_config(), clock.clone())
            .context("failed to build HTTP dispatcher")?,
    );
    let mut scheduler = Scheduler::new(store, dispatcher, config.to_scheduler_config(), clock)
        .context("failed to build scheduler")?;

    scheduler.start().await.context("failed to start scheduler")?;
    info!(owner = %scheduler.owner(), "hooky is running");

    shutdown_signal().await;
    info!("shutdown signal received, stopping scheduler");

    if let Err(e) = scheduler.stop().await {
        error!(error = %e, "scheduler did not stop cleanly");
    }
    let stats = scheduler.stats().await;
    info!(
        reserved = stats.reserved,
        delivered = stats.delivered,
        retried = stats.retried,
        failed = stats.failed,
        lease_lost = stats.lease_lost,
        "scheduler stopped"
    );

    pool.close().await;
    info!("hooky shutdown complete");
    Ok(())
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured filter.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
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

/// Waits for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

//! Webhooker webhook fan-out service.
//!
//! Main entry point. Initializes all subsystems and coordinates graceful
//! startup and shutdown of the HTTP server and the delivery engine.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use webhooker_api::{AppState, Config};
use webhooker_core::{storage::Storage, Clock, RealClock};
use webhooker_delivery::DeliveryEngine;

const DEFAULT_LOG_FILTER: &str = "info,webhooker=debug,tower_http=debug";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting webhooker");

    let addr = config.parse_server_addr()?;
    info!(
        database_url = %config.database_url_masked(),
        server_addr = %addr,
        max_connections = config.database_max_connections,
        worker_pool_size = config.worker_pool_size,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.migrate().await.context("Failed to apply database schema")?;
    info!("Database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let mut engine = DeliveryEngine::new(storage, config.to_delivery_config(), clock.clone())
        .context("Failed to create delivery engine")?;
    engine.start().await.context("Failed to start delivery engine")?;

    let state = AppState::new(engine.storage(), engine.broadcaster(), clock);
    let request_timeout = Duration::from_secs(config.request_timeout);

    info!(addr = %addr, "webhooker is ready to broadcast events");

    // Returns once a shutdown signal has drained in-flight requests.
    let served = webhooker_api::start_server(state, addr, request_timeout).await;

    engine.shutdown().await.context("Delivery engine did not stop cleanly")?;
    info!("Delivery engine stopped");

    db_pool.close().await;
    info!("Database connections closed");

    served.context("HTTP server failed")?;
    info!("webhooker shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured filter (`RUST_LOG` overrides
/// the config file), falling back to the default filter if it is invalid.
fn init_tracing(directives: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

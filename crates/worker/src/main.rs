use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nodefleet_core::registry::NodeRegistry;
use nodefleet_core::scripting::ScriptJobQueue;
use nodefleet_core::secrets::MemorySecretStore;
use nodefleet_db::PgNodeStore;
use nodefleet_worker::config::WorkerConfig;
use nodefleet_worker::runner::ScriptRunner;
use nodefleet_worker::sweep::ExpirationSweep;

const DEFAULT_LOG_FILTER: &str = "nodefleet_worker=debug,nodefleet_core=info,nodefleet_db=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    init_tracing();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        working_root = %config.working_root.display(),
        sweep_enabled = config.sweep_enabled,
        "Loaded worker configuration"
    );

    // --- Database ---
    let pool = nodefleet_db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    nodefleet_db::health_check(&pool)
        .await
        .context("Database health check failed")?;

    nodefleet_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Registry ---
    let registry = NodeRegistry::new(
        Arc::new(PgNodeStore::new(pool.clone())),
        Arc::new(MemorySecretStore::new()),
    );

    // --- Background tasks ---
    let cancel = CancellationToken::new();

    let queue = ScriptJobQueue::new(&config.working_root);
    let runner_handle = tokio::spawn(
        ScriptRunner::new(queue, registry.clone())
            .run(config.script_poll_interval, cancel.clone()),
    );

    let sweep_handle = if config.sweep_enabled {
        Some(tokio::spawn(
            ExpirationSweep::new(registry, config.sweep_max_attempts)
                .run(config.sweep_interval, cancel.clone()),
        ))
    } else {
        tracing::info!("Expiration sweep disabled");
        None
    };

    // --- Shutdown ---
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, stopping background tasks");
    cancel.cancel();

    if let Err(e) = runner_handle.await {
        tracing::error!(error = %e, "Script runner task panicked");
    }
    if let Some(handle) = sweep_handle {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Expiration sweep task panicked");
        }
    }

    pool.close().await;
    tracing::info!("Worker stopped");
    Ok(())
}

/// `RUST_LOG` filters; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

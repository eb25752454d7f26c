//! # runonce
//!
//! Patient onboarding service whose activities run at most once even
//! though the orchestrator delivers them at least once.
//!
//! ## Startup Sequence
//!
//! 1. **Configuration** - TOML file plus `RUNONCE_*` overrides
//! 2. **Tracing** - `RUST_LOG`, falling back to `--log-level`
//! 3. **Store** - in-memory or SurrealDB
//! 4. **Orchestrator** - in-process orchestrator
//! 5. **Ledger Collector** - periodic sweep of closed executions' keys
//! 6. **Axum API** - serves until Ctrl+C
//!
//! ## Shutdown
//!
//! The server drains in-flight requests, then the collector is stopped.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use runonce_guard::{
    ExecutionCleanup, IdempotencyGuard, InMemoryOrchestrator, InMemoryStore, Ledger,
    LedgerCollector, Orchestrator, SurrealStore, TransactionalStore,
};
use runonce_onboarding::{OnboardingWorkflow, ServiceExecutor};
use runonce_web::AppState;

mod cli;
mod config;

use cli::{Cli, Commands};
use config::{AppConfig, StoreBackend};

/// How long the collector gets to finish an in-progress sweep on shutdown.
const COLLECTOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Serve {
            config,
            bind,
            log_level,
        } => {
            let mut config = AppConfig::load(config.as_deref())
                .context("Failed to load configuration")?;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            init_tracing(&log_level);
            serve(config).await
        }
        Commands::Config { config } => print_config(config.as_deref()),
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!(bind = %config.server.bind, "runonce starting");

    let store = open_store(&config)
        .await
        .context("Store initialization failed. Please check the store configuration")?;
    let orchestrator: Arc<dyn Orchestrator> = Arc::new(
        InMemoryOrchestrator::new().with_retention(config.orchestrator.closed_retention),
    );
    let ledger = Ledger::default();

    let collector = LedgerCollector::new(Arc::clone(&store), ledger.clone(), Arc::clone(&orchestrator))
        .start(config.collector_config()?)
        .context("Failed to start ledger collector")?;

    let guard = IdempotencyGuard::new(Arc::clone(&store), ledger.clone(), config.guard);
    let services = config
        .services
        .build()
        .context("Failed to configure onboarding services")?;
    let executor = ServiceExecutor::new(guard, services).with_work_delay(config.services.work_delay());
    let workflow = OnboardingWorkflow::new(
        orchestrator,
        executor,
        ExecutionCleanup::new(store, ledger),
    );

    info!("runonce is running. Press Ctrl+C to stop.");
    let served = runonce_web::serve(config.server.bind, AppState::new(workflow), wait_for_shutdown())
        .await
        .context("Web server failed");

    info!("Cleaning up...");
    if let Err(err) = collector.shutdown(COLLECTOR_SHUTDOWN_TIMEOUT).await {
        warn!(error = %err, "Ledger collector did not stop cleanly");
    }

    served?;
    info!("runonce stopped gracefully");
    Ok(())
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn TransactionalStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreBackend::Surreal => {
            let store = SurrealStore::connect(config.store.surreal_config())
                .await
                .with_context(|| format!("Failed to connect to SurrealDB at {}", config.store.url))?;
            store
                .health_check()
                .await
                .context("SurrealDB health check failed")?;
            Ok(Arc::new(store))
        }
    }
}

fn print_config(path: Option<&Path>) -> Result<()> {
    let config = AppConfig::load(path).context("Failed to load configuration")?;
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}

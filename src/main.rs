use std::sync::Arc;

use shopper_dispatch::api;
use shopper_dispatch::config::{Config, LogFormat};
use shopper_dispatch::engine::dispatch::run_dispatch_workers;
use shopper_dispatch::error::AppError;
use shopper_dispatch::gateway::run_liveness_sweeper;
use shopper_dispatch::ledger::store::{InMemoryStore, JournalStore, LedgerStore};
use shopper_dispatch::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    match config.log_format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(config.log_level.clone()))
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(config.log_level.clone()))
            .json()
            .init(),
    }

    let store: Arc<dyn LedgerStore> = match &config.ledger_journal_path {
        Some(path) => {
            let journal = JournalStore::open(path)
                .await
                .map_err(|err| AppError::Internal(format!("failed to open ledger journal: {err}")))?;
            tracing::info!(path = %journal.path().display(), "ledger journal opened");
            Arc::new(journal)
        }
        None => {
            tracing::warn!("LEDGER_JOURNAL_PATH not set; ledger is in-memory only");
            Arc::new(InMemoryStore::default())
        }
    };

    let workers = config.dispatch.workers;
    let sweep_every = config.session.heartbeat_interval;
    let http_port = config.http_port;

    let (app_state, order_rx) = AppState::new(config, store);
    let shared_state = Arc::new(app_state);

    let recovered = shared_state.engine.recover().await?;
    tracing::info!(pending = recovered, "ledger recovered");

    let app = api::rest::router(shared_state.clone());

    tokio::spawn(run_dispatch_workers(
        shared_state.engine.clone(),
        order_rx,
        workers,
    ));
    tokio::spawn(run_liveness_sweeper(shared_state.gateway.clone(), sweep_every));

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

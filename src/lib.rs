pub mod api;
pub mod audit;
pub mod automation;
pub mod config;
pub mod confirmation;
pub mod conversation;
pub mod core_state; // Shared state for handlers and background tasks
pub mod db;
pub mod messaging;
pub mod models;
pub mod triage;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::audit::{AuditSink, QueuedAuditSink};
use crate::config::{ClinicConfig, ConfigError};
use crate::confirmation::ConfirmationScheduler;
use crate::core_state::{CoreError, CoreState};
use crate::db::{Database, DatabaseError};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Server(#[from] api::ServerError),
}

/// Run the service until Ctrl-C.
pub async fn run() -> Result<(), StartupError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("DentaFlow starting v{}", config::APP_VERSION);

    let config = ClinicConfig::from_env()?;
    let database = Database::initialize(&config.db_path)?;
    tracing::info!(path = %database.path().display(), "Database ready");

    let (audit, audit_writer) = QueuedAuditSink::start(database.clone());
    let audit: Arc<dyn AuditSink> = Arc::new(audit);
    let bind_addr = config.bind_addr;
    let core = Arc::new(CoreState::from_config(database, config, Arc::clone(&audit))?);

    let scheduler = ConfirmationScheduler::start(Arc::clone(&core));
    let server = api::start_api_server(Arc::clone(&core), bind_addr).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for shutdown signal: {e}");
    }
    tracing::info!("Shutting down");

    server.stop().await;
    scheduler.stop().await;
    audit.flush().await;

    // The writer exits once the last sink handle is gone.
    drop(core);
    drop(audit);
    if let Err(e) = audit_writer.await {
        tracing::warn!("Audit writer ended abnormally: {e}");
    }

    tracing::info!("DentaFlow stopped");
    Ok(())
}

//! Tandem - headless sync daemon.
//!
//! Signs one principal in against an HTTP remote, keeps the file-backed
//! local store in sync until interrupted, then flushes what is left.

use std::sync::Arc;
use tandem_client::{
    catalog, ConfigError, FileBackend, HttpRemote, LocalStore, SyncConfig, SyncEngine,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_client=debug,tandem_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;
    let remote_url = config
        .remote_url
        .clone()
        .ok_or(ConfigError::MissingVar("TANDEM_REMOTE_URL"))?;
    let principal = config
        .principal
        .clone()
        .ok_or(ConfigError::MissingVar("TANDEM_PRINCIPAL"))?;

    let backend = FileBackend::open(&config.store_dir)?;
    let store = Arc::new(LocalStore::new(Arc::new(backend)));

    let mut remote = HttpRemote::new(remote_url.as_str(), config.request_timeout)?;
    if let Some(token) = &config.api_token {
        remote = remote.with_token(token.as_str());
    }

    tracing::info!(
        "Starting Tandem sync for {} against {} (store {})",
        principal,
        remote_url,
        config.store_dir.display()
    );

    let engine = SyncEngine::new(catalog::standard_schema(), store, Arc::new(remote), config);
    engine.initialize_for_principal(&principal).await?;
    tracing::info!(status = ?engine.status(), "Initial sync finished");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, flushing pending changes");

    engine.shutdown().await?;
    Ok(())
}

pub mod analysis;
pub mod api;
pub mod config;
pub mod core_state;
pub mod engine;
pub mod taxonomy;

use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] core_state::CoreError),

    #[error(transparent)]
    Server(#[from] api::ServerError),
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}

/// Start the service and block until shutdown.
pub async fn run() -> Result<(), AppError> {
    init_tracing();

    tracing::info!("PathoLens starting v{}", config::APP_VERSION);

    let config = config::ServerConfig::from_env();
    tracing::info!(
        backend = %config.backend,
        models_dir = %config.models_dir.display(),
        "Configuration loaded"
    );

    let core = Arc::new(core_state::CoreState::new(config)?);
    api::serve(core).await?;
    Ok(())
}

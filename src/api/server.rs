//! Server lifecycle: bind, serve, shut down on Ctrl-C.
//!
//! On shutdown every engine is released before the process exits.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::router::api_router;
use crate::core_state::CoreState;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve the API on the configured address until Ctrl-C.
pub async fn serve(core: Arc<CoreState>) -> Result<(), ServerError> {
    let addr = core.config.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    serve_on(listener, core, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_on(
    listener: TcpListener,
    core: Arc<CoreState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let addr = listener.local_addr()?;
    let app = api_router(core.clone());

    tracing::info!(%addr, "PathoLens API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let shutdown_core = core.clone();
    tokio::task::spawn_blocking(move || shutdown_core.shutdown())
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    tracing::info!("PathoLens API stopped");
    Ok(())
}

/// Handle to a server running in a background task.
pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<Result<(), ServerError>>,
}

impl RunningServer {
    /// Signal shutdown and wait for the server (and engine release) to finish.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

/// Bind `addr` and serve in a background task.
pub async fn spawn(core: Arc<CoreState>, addr: SocketAddr) -> Result<RunningServer, ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(serve_on(listener, core, async move {
        let _ = shutdown_rx.await;
        tracing::info!("Shutdown signal received");
    }));

    Ok(RunningServer {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Ctrl-C received, shutting down"),
        Err(e) => tracing::error!("Failed to listen for Ctrl-C: {e}"),
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

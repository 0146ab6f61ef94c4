//! HTTP surface for zipstream: the index page and streamed ZIP downloads.

pub mod body;
pub mod error;
pub mod handlers;

use axum::Router;
use axum::routing::get;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use zipstream_core::error::Result;
use zipstream_core::{ArchiveLocator, Config, Launcher, ZipLauncher};

/// Read-only state shared by every request.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    locator: Arc<ArchiveLocator>,
    launcher: Arc<dyn Launcher>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        config.validate()?;
        let locator = ArchiveLocator::new(&config.root)?;
        let launcher = ZipLauncher::from_config(&config);
        Ok(Self {
            config: Arc::new(config),
            locator: Arc::new(locator),
            launcher: Arc::new(launcher),
            shutdown,
        })
    }

    /// Replaces the archiver launcher, e.g. to observe spawns.
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locator(&self) -> &ArchiveLocator {
        &self.locator
    }

    pub fn launcher(&self) -> &dyn Launcher {
        self.launcher.as_ref()
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index_page))
        .route("/archive/{id}/", get(handlers::archive))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until the state's shutdown token is cancelled. Cancelling it also
/// interrupts every archive still streaming.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = state.config().bind;
    let shutdown = state.shutdown().clone();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        root = %state.locator().root().display(),
        chunk_kib = state.config().chunk_kib,
        "listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

use std::path::{Path, PathBuf};

use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use zipstream_core::error::Result;
use zipstream_core::{ArchiveLocator, Config, Launcher, StreamSession, WriterSink, ZipLauncher};
use zipstream_http::AppState;

pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            token.cancel();
        }
    });
}

pub async fn handle_serve(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let state = AppState::new(config, shutdown.clone())?;
    cancel_on_ctrl_c(shutdown);
    zipstream_http::serve(state).await
}

pub async fn handle_archive(config: Config, id: String, out: PathBuf) -> Result<()> {
    config.validate()?;
    let locator = ArchiveLocator::new(&config.root)?;
    let dir = locator.locate(&id).await?;
    let job = ZipLauncher::from_config(&config).launch(&dir).await?;

    let to_stdout = out == Path::new("-");
    let writer: Box<dyn AsyncWrite + Send + Sync + Unpin> = if to_stdout {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(tokio::fs::File::create(&out).await?)
    };

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut session = StreamSession::from_config(id.as_str(), &config);
    if let Err(e) = session.run(job, WriterSink::new(writer), cancel).await {
        if !to_stdout {
            let _ = tokio::fs::remove_file(&out).await;
        }
        return Err(e);
    }

    let stats = session.stats();
    eprintln!(
        "archive: wrote {} bytes in {} chunks to {}",
        stats.bytes,
        stats.chunks,
        out.display()
    );
    Ok(())
}

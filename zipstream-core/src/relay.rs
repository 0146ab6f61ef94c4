use crate::error::{Result, ZipStreamError};
use crate::launcher::ArchiveJob;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Destination of relayed chunks, usually an HTTP response body.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Hands over one chunk; resolves once the sink has room for the next.
    async fn send(&mut self, chunk: Bytes) -> Result<()>;

    /// Resolves when the consumer has gone away.
    async fn closed(&self);

    /// Ends the stream normally.
    async fn finish(&mut self) -> Result<()>;

    /// Ends the stream abnormally so the consumer sees a truncated transfer.
    fn abort(&mut self, reason: &str);
}

#[derive(Clone, Copy, Debug)]
pub struct RelaySettings {
    pub chunk_size: usize,
    pub delay: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Pumps archive output into `sink` one chunk at a time until end of stream.
///
/// Every suspension point also watches `cancel` and, while reading or pausing,
/// the sink's consumer, so a disconnect yields `Interrupted` promptly.
pub async fn relay<S: ChunkSink + ?Sized>(
    job: &mut ArchiveJob,
    sink: &mut S,
    settings: RelaySettings,
    cancel: &CancellationToken,
    stats: &mut RelayStats,
) -> Result<()> {
    let mut buf = vec![0u8; settings.chunk_size.max(1)];
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ZipStreamError::Interrupted),
            _ = sink.closed() => return Err(ZipStreamError::Interrupted),
            read = job.read_chunk(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        stats.chunks += 1;
        stats.bytes += n as u64;
        tracing::debug!(
            chunk = stats.chunks,
            len = n,
            source = %job.source().display(),
            "sending archive chunk"
        );

        let chunk = Bytes::copy_from_slice(&buf[..n]);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ZipStreamError::Interrupted),
            sent = sink.send(chunk) => sent?,
        }

        if let Some(delay) = settings.delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ZipStreamError::Interrupted),
                _ = sink.closed() => return Err(ZipStreamError::Interrupted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Sink over any async writer, e.g. a file or stdout.
pub struct WriterSink<W> {
    inner: Option<W>,
}

impl<W> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + Sync> ChunkSink for WriterSink<W> {
    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        let w = self.inner.as_mut().ok_or(ZipStreamError::Interrupted)?;
        w.write_all(&chunk).await?;
        Ok(())
    }

    async fn closed(&self) {
        // a writer has no consumer that can hang up
        std::future::pending::<()>().await
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut w) = self.inner.take() {
            w.flush().await?;
            w.shutdown().await?;
        }
        Ok(())
    }

    fn abort(&mut self, reason: &str) {
        tracing::debug!(reason, "abandoning writer output");
        self.inner = None;
    }
}

//! Channel-backed response body fed by a relay task.

use async_trait::async_trait;
use axum::body::Bytes;
use futures_core::Stream;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use zipstream_core::error::{Result, ZipStreamError};
use zipstream_core::relay::ChunkSink;

/// One chunk in flight: the relay waits for the body to take it before reading on.
const BODY_CAPACITY: usize = 1;

/// Creates a connected sink/body pair.
pub fn channel() -> (BodySink, ArchiveBody) {
    let (tx, rx) = mpsc::channel(BODY_CAPACITY);
    let aborted = Arc::new(AtomicBool::new(false));
    (
        BodySink {
            tx: Some(tx),
            aborted: aborted.clone(),
        },
        ArchiveBody {
            rx,
            aborted,
            done: false,
        },
    )
}

/// Sending half, owned by the relay.
pub struct BodySink {
    tx: Option<mpsc::Sender<Bytes>>,
    aborted: Arc<AtomicBool>,
}

#[async_trait]
impl ChunkSink for BodySink {
    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(ZipStreamError::Interrupted)?;
        // a dropped receiver means the client went away
        tx.send(chunk)
            .await
            .map_err(|_| ZipStreamError::Interrupted)
    }

    async fn closed(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }

    async fn finish(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }

    fn abort(&mut self, reason: &str) {
        tracing::debug!(reason, "aborting response body");
        self.aborted.store(true, Ordering::Release);
        self.tx = None;
    }
}

/// Receiving half, handed to axum as the response body.
///
/// Ends cleanly when the sink finishes. When the sink aborts, yields one error
/// so hyper tears the connection down instead of ending the chunked body.
pub struct ArchiveBody {
    rx: mpsc::Receiver<Bytes>,
    aborted: Arc<AtomicBool>,
    done: bool,
}

impl Stream for ArchiveBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                self.done = true;
                if self.aborted.load(Ordering::Acquire) {
                    Poll::Ready(Some(Err(io::Error::other("archive stream aborted"))))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

//! One streaming session: an archive job paired with one outbound response.
//!
//! States run `Idle → HeadersSent → Streaming → {Completed | Cancelled | Failed} → Closed`.
//! Whatever terminal state is reached, the archiver is reaped and the sink is
//! closed exactly once before `run` returns.

use crate::config::Config;
use crate::error::{Result, ZipStreamError};
use crate::launcher::ArchiveJob;
use crate::relay::{ChunkSink, RelaySettings, RelayStats, relay};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    HeadersSent,
    Streaming,
    Completed,
    Cancelled,
    Failed,
    Closed,
}

impl SessionState {
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, HeadersSent)
                | (HeadersSent, Streaming)
                | (Streaming, Completed | Cancelled | Failed)
                | (Completed | Cancelled | Failed, Closed)
        )
    }
}

/// Closes the wrapped sink exactly once, on drop if nobody did it earlier.
pub struct ResponseGuard<S: ChunkSink> {
    sink: Option<S>,
}

impl<S: ChunkSink> ResponseGuard<S> {
    pub fn new(sink: S) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn sink_mut(&mut self) -> Option<&mut S> {
        self.sink.as_mut()
    }

    pub async fn finish(mut self) -> Result<()> {
        match self.sink.take() {
            Some(mut s) => s.finish().await,
            None => Ok(()),
        }
    }

    pub fn abort(mut self, reason: &str) {
        if let Some(mut s) = self.sink.take() {
            s.abort(reason);
        }
    }
}

impl<S: ChunkSink> Drop for ResponseGuard<S> {
    fn drop(&mut self) {
        if let Some(mut s) = self.sink.take() {
            s.abort("session dropped before completion");
        }
    }
}

#[derive(Debug)]
pub struct StreamSession {
    id: String,
    settings: RelaySettings,
    stats: RelayStats,
    state: SessionState,
    terminal: Option<SessionState>,
    pid: Option<u32>,
}

impl StreamSession {
    pub fn new(id: impl Into<String>, chunk_size: usize, delay: Option<Duration>) -> Self {
        Self {
            id: id.into(),
            settings: RelaySettings {
                chunk_size: chunk_size.max(1),
                delay: delay.filter(|d| !d.is_zero()),
            },
            stats: RelayStats::default(),
            state: SessionState::Idle,
            terminal: None,
            pid: None,
        }
    }

    pub fn from_config(id: impl Into<String>, cfg: &Config) -> Self {
        Self::new(id, cfg.chunk_size(), cfg.delay())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Which of `Completed`, `Cancelled` or `Failed` the session ended in.
    pub fn terminal_state(&self) -> Option<SessionState> {
        self.terminal
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Pid of the archiver this session streamed, if it had one.
    pub fn archiver_pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn chunk_size(&self) -> usize {
        self.settings.chunk_size
    }

    /// Records that status and headers have been committed to the response.
    pub fn headers_sent(&mut self) {
        self.advance(SessionState::HeadersSent);
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid session transition {:?} -> {next:?}",
            self.state
        );
        tracing::trace!(id = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
        if matches!(
            next,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        ) {
            self.terminal = Some(next);
        }
    }

    /// Streams `job` into `sink` until the archive ends, the consumer leaves,
    /// `cancel` fires, or I/O fails. Cancellation and failures come back as
    /// errors after the archiver has been killed and reaped.
    pub async fn run<S: ChunkSink>(
        &mut self,
        mut job: ArchiveJob,
        sink: S,
        cancel: CancellationToken,
    ) -> Result<()> {
        if self.state == SessionState::Idle {
            self.headers_sent();
        }
        let mut guard = ResponseGuard::new(sink);
        // tokio forgets the pid once the child is reaped
        self.pid = job.pid();
        self.advance(SessionState::Streaming);
        tracing::debug!(
            id = %self.id,
            pid = ?self.pid,
            source = %job.source().display(),
            extension = job.extension().unwrap_or("*"),
            chunk_size = self.settings.chunk_size,
            "streaming archive"
        );

        let relayed = match guard.sink_mut() {
            Some(sink) => relay(&mut job, sink, self.settings, &cancel, &mut self.stats).await,
            None => Err(ZipStreamError::Interrupted),
        };
        let outcome = match relayed {
            Ok(()) => job.finish().await.map(|_| ()),
            Err(e) => {
                job.terminate().await;
                Err(e)
            }
        };

        let pid = self.pid;
        let outcome = match outcome {
            Ok(()) => match guard.finish().await {
                Ok(()) => {
                    self.advance(SessionState::Completed);
                    tracing::info!(
                        id = %self.id,
                        chunks = self.stats.chunks,
                        bytes = self.stats.bytes,
                        "archive sent"
                    );
                    Ok(())
                }
                Err(e) => {
                    self.advance(SessionState::Failed);
                    tracing::error!(id = %self.id, error = %e, "failed to close archive stream");
                    Err(e)
                }
            },
            Err(ZipStreamError::Interrupted) => {
                self.advance(SessionState::Cancelled);
                guard.abort("download interrupted");
                tracing::warn!(
                    id = %self.id,
                    ?pid,
                    chunks = self.stats.chunks,
                    "Download was interrupted."
                );
                Err(ZipStreamError::Interrupted)
            }
            Err(e) => {
                self.advance(SessionState::Failed);
                guard.abort(&e.to_string());
                tracing::error!(
                    id = %self.id,
                    ?pid,
                    chunks = self.stats.chunks,
                    error = %e,
                    "archive stream failed"
                );
                Err(e)
            }
        };
        self.advance(SessionState::Closed);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{ArchiveExit, ArchiveProcess, JobStatus};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;
    use std::path::PathBuf;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Tracker {
        killed: AtomicBool,
        waits: AtomicUsize,
    }

    struct FakeProcess {
        out: Box<dyn AsyncRead + Send + Unpin>,
        code: i32,
        tracker: Arc<Tracker>,
    }

    #[async_trait]
    impl ArchiveProcess for FakeProcess {
        // like tokio, the pid is gone once the child has been reaped
        fn pid(&self) -> Option<u32> {
            (self.tracker.waits.load(Ordering::SeqCst) == 0).then_some(4242)
        }

        fn stdout(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
            &mut *self.out
        }

        fn kill(&mut self) -> io::Result<()> {
            self.tracker.killed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&mut self) -> io::Result<ArchiveExit> {
            self.tracker.waits.fetch_add(1, Ordering::SeqCst);
            if self.tracker.killed.load(Ordering::SeqCst) {
                Ok(ArchiveExit { code: None })
            } else {
                Ok(ArchiveExit {
                    code: Some(self.code),
                })
            }
        }
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }
    }

    fn job(out: impl AsyncRead + Send + Unpin + 'static, code: i32) -> (ArchiveJob, Arc<Tracker>) {
        let tracker = Arc::new(Tracker::default());
        let process = FakeProcess {
            out: Box::new(out),
            code,
            tracker: tracker.clone(),
        };
        (
            ArchiveJob::new(PathBuf::from("/photos/abc123"), None, Box::new(process)),
            tracker,
        )
    }

    #[derive(Clone, Default)]
    struct Recorded {
        chunks: Arc<Mutex<Vec<Bytes>>>,
        finished: Arc<AtomicUsize>,
        aborted: Arc<AtomicUsize>,
    }

    struct RecordingSink {
        rec: Recorded,
        gone: Arc<Notify>,
        hang_up_after: Option<usize>,
    }

    impl RecordingSink {
        fn new(rec: &Recorded) -> Self {
            Self {
                rec: rec.clone(),
                gone: Arc::new(Notify::new()),
                hang_up_after: None,
            }
        }
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        async fn send(&mut self, chunk: Bytes) -> Result<()> {
            let mut chunks = self.rec.chunks.lock().unwrap();
            chunks.push(chunk);
            if self.hang_up_after == Some(chunks.len()) {
                self.gone.notify_one();
            }
            Ok(())
        }

        async fn closed(&self) {
            self.gone.notified().await
        }

        async fn finish(&mut self) -> Result<()> {
            self.rec.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn abort(&mut self, _reason: &str) {
            self.rec.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn archive_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn completes_in_order_within_chunk_size() {
        let data = archive_bytes(10 * 1024);
        let (job, tracker) = job(std::io::Cursor::new(data.clone()), 0);
        let rec = Recorded::default();
        let mut session = StreamSession::new("abc123", 1024, None);
        session.headers_sent();

        session
            .run(job, RecordingSink::new(&rec), CancellationToken::new())
            .await
            .unwrap();

        let chunks = rec.chunks.lock().unwrap();
        assert!(chunks.len() >= 10);
        assert!(chunks.iter().all(|c| c.len() <= 1024));
        assert_eq!(chunks.concat(), data);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.terminal_state(), Some(SessionState::Completed));
        assert_eq!(session.stats().bytes, data.len() as u64);
        assert_eq!(rec.finished.load(Ordering::SeqCst), 1);
        assert_eq!(rec.aborted.load(Ordering::SeqCst), 0);
        assert!(!tracker.killed.load(Ordering::SeqCst));
        assert_eq!(tracker.waits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nonzero_exit_fails_and_aborts() {
        let (job, _tracker) = job(std::io::Cursor::new(archive_bytes(100)), 12);
        let rec = Recorded::default();
        let mut session = StreamSession::new("abc123", 64, None);

        let err = session
            .run(job, RecordingSink::new(&rec), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ZipStreamError::ArchiverExit { code: Some(12) }));
        assert_eq!(session.terminal_state(), Some(SessionState::Failed));
        assert_eq!(rec.finished.load(Ordering::SeqCst), 0);
        assert_eq!(rec.aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_error_kills_and_reaps() {
        let (job, tracker) = job(BrokenPipe, 0);
        let rec = Recorded::default();
        let mut session = StreamSession::new("abc123", 64, None);

        let err = session
            .run(job, RecordingSink::new(&rec), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ZipStreamError::Stream(_)));
        assert_eq!(session.terminal_state(), Some(SessionState::Failed));
        assert!(tracker.killed.load(Ordering::SeqCst));
        assert_eq!(tracker.waits.load(Ordering::SeqCst), 1);
        assert_eq!(rec.aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consumer_hang_up_cancels() {
        let (job, tracker) = job(tokio::io::repeat(7), 0);
        let rec = Recorded::default();
        let mut sink = RecordingSink::new(&rec);
        sink.hang_up_after = Some(3);
        let mut session = StreamSession::new("abc123", 512, None);

        let err = session
            .run(job, sink, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ZipStreamError::Interrupted));
        assert_eq!(session.terminal_state(), Some(SessionState::Cancelled));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(tracker.killed.load(Ordering::SeqCst));
        assert_eq!(tracker.waits.load(Ordering::SeqCst), 1);
        assert_eq!(rec.chunks.lock().unwrap().len(), 3);
        assert_eq!(rec.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_token_interrupts_delay() {
        let (job, tracker) = job(tokio::io::repeat(1), 0);
        let rec = Recorded::default();
        let cancel = CancellationToken::new();
        let mut session = StreamSession::new("abc123", 16, Some(Duration::from_secs(60)));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            trigger.cancel();
        });
        let err = session
            .run(job, RecordingSink::new(&rec), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ZipStreamError::Interrupted));
        // chunk at t=0 and t=60, cancelled while pausing before the third
        assert_eq!(rec.chunks.lock().unwrap().len(), 2);
        assert!(tracker.killed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_paces_chunks() {
        let (job, _tracker) = job(std::io::Cursor::new(archive_bytes(40)), 0);
        let rec = Recorded::default();
        let mut session = StreamSession::new("abc123", 10, Some(Duration::from_millis(500)));

        let start = tokio::time::Instant::now();
        session
            .run(job, RecordingSink::new(&rec), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rec.chunks.lock().unwrap().len(), 4);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn keeps_archiver_pid_after_reaping() {
        let (job, tracker) = job(tokio::io::repeat(3), 0);
        let rec = Recorded::default();
        let mut sink = RecordingSink::new(&rec);
        sink.hang_up_after = Some(1);
        let mut session = StreamSession::new("abc123", 8, None);

        let err = session
            .run(job, sink, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ZipStreamError::Interrupted));
        assert_eq!(tracker.waits.load(Ordering::SeqCst), 1);
        assert_eq!(session.archiver_pid(), Some(4242));
    }

    #[tokio::test]
    async fn terminate_after_exit_is_a_no_op() {
        let (mut job, tracker) = job(std::io::Cursor::new(Vec::new()), 0);
        job.finish().await.unwrap();
        job.terminate().await;
        assert_eq!(job.status(), JobStatus::Exited(ArchiveExit { code: Some(0) }));
        assert!(!tracker.killed.load(Ordering::SeqCst));
    }

    #[test]
    fn guard_closes_once_on_drop() {
        let rec = Recorded::default();
        drop(ResponseGuard::new(RecordingSink::new(&rec)));
        assert_eq!(rec.aborted.load(Ordering::SeqCst), 1);

        let rec = Recorded::default();
        ResponseGuard::new(RecordingSink::new(&rec)).abort("failed");
        assert_eq!(rec.aborted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use SessionState::*;
        assert!(Idle.can_advance_to(HeadersSent));
        assert!(Streaming.can_advance_to(Cancelled));
        assert!(Failed.can_advance_to(Closed));
        assert!(!Idle.can_advance_to(Streaming));
        assert!(!Closed.can_advance_to(Closed));
        assert!(!Completed.can_advance_to(Failed));
    }
}

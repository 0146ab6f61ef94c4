#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod launcher;
pub mod locate;
pub mod relay;
pub mod session;

// Re-exports: stable API surface
pub use config::Config;
pub use error::{Result, ZipStreamError};
pub use launcher::{ArchiveExit, ArchiveJob, ArchiveMode, ArchiveProcess, Launcher, ZipLauncher};
pub use locate::ArchiveLocator;
pub use relay::{ChunkSink, WriterSink};
pub use session::{SessionState, StreamSession};

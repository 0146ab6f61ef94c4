//! Spawning the external archiver and owning the running process.

use crate::config::Config;
use crate::error::{Result, ZipStreamError};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use walkdir::WalkDir;

/// How an archiver exited. `code` is `None` when it was killed by a signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveExit {
    pub code: Option<i32>,
}

impl ArchiveExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ArchiveExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A running archiver: a readable byte stream plus kill and reap.
#[async_trait]
pub trait ArchiveProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn stdout(&mut self) -> &mut (dyn AsyncRead + Send + Unpin);

    /// Requests termination without waiting for it.
    fn kill(&mut self) -> io::Result<()>;

    async fn wait(&mut self) -> io::Result<ArchiveExit>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Starts archiving `source`. Returns once the process is running and its
    /// output can be read; never waits for it to finish.
    async fn launch(&self, source: &Path) -> Result<ArchiveJob>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveMode {
    /// Every file under the directory, recursively, paths junked.
    Recursive,
    /// Files directly under the directory with this extension, paths junked.
    Filtered { extension: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Exited(ArchiveExit),
    Terminated,
}

/// One archiving subprocess, owned by a single stream session.
pub struct ArchiveJob {
    source: PathBuf,
    extension: Option<String>,
    process: Box<dyn ArchiveProcess>,
    status: JobStatus,
}

impl ArchiveJob {
    pub fn new(
        source: PathBuf,
        extension: Option<String>,
        process: Box<dyn ArchiveProcess>,
    ) -> Self {
        Self {
            source,
            extension,
            process,
            status: JobStatus::Running,
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn extension(&self) -> Option<&str> {
        self.extension.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Reads the next piece of archive output. `Ok(0)` means end of stream.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.process.stdout().read(buf).await
    }

    /// Reaps the process after its output is exhausted.
    pub async fn finish(&mut self) -> Result<ArchiveExit> {
        let exit = self.process.wait().await?;
        self.status = JobStatus::Exited(exit);
        if exit.success() {
            Ok(exit)
        } else {
            Err(ZipStreamError::ArchiverExit { code: exit.code })
        }
    }

    /// Kills the process and waits until it is reaped. No-op once it has exited.
    pub async fn terminate(&mut self) {
        if self.status != JobStatus::Running {
            return;
        }
        let pid = self.pid();
        if let Err(e) = self.process.kill() {
            // already gone on its own; still reap below
            tracing::debug!(?pid, error = %e, "kill failed");
        }
        match self.process.wait().await {
            Ok(exit) => tracing::debug!(?pid, code = ?exit.code, "archiver reaped"),
            Err(e) => tracing::error!(?pid, error = %e, "failed to reap archiver"),
        }
        self.status = JobStatus::Terminated;
    }
}

impl std::fmt::Debug for ArchiveJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveJob")
            .field("source", &self.source)
            .field("extension", &self.extension)
            .field("pid", &self.pid())
            .field("status", &self.status)
            .finish()
    }
}

/// Child process handle backed by `tokio::process`.
pub struct ZipProcess {
    child: Child,
    stdout: ChildStdout,
}

#[async_trait]
impl ArchiveProcess for ZipProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn stdout(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.stdout
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<ArchiveExit> {
        Ok(self.child.wait().await?.into())
    }
}

/// Launches Info-ZIP `zip` writing the archive to its stdout.
#[derive(Clone, Debug)]
pub struct ZipLauncher {
    program: PathBuf,
    mode: ArchiveMode,
}

impl ZipLauncher {
    pub fn new(program: impl Into<PathBuf>, mode: ArchiveMode) -> Self {
        Self {
            program: program.into(),
            mode,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let mode = match cfg.normalized_extension() {
            Some(extension) => ArchiveMode::Filtered { extension },
            None => ArchiveMode::Recursive,
        };
        Self::new(&cfg.zip_program, mode)
    }

    pub fn mode(&self) -> &ArchiveMode {
        &self.mode
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Arguments for archiving `source`: quiet, no extra attributes, junk paths,
    /// archive written to stdout.
    pub async fn args_for(&self, source: &Path) -> Result<Vec<OsString>> {
        let mut args: Vec<OsString> = vec!["-q".into(), "-X".into(), "-j".into()];
        match &self.mode {
            ArchiveMode::Recursive => {
                args.push("-r".into());
                args.push("-".into());
                args.push(source.as_os_str().to_owned());
            }
            ArchiveMode::Filtered { extension } => {
                let dir = source.to_path_buf();
                let ext = extension.clone();
                let files = tokio::task::spawn_blocking(move || matching_files(&dir, &ext))
                    .await
                    .map_err(io::Error::other)??;
                if files.is_empty() {
                    return Err(ZipStreamError::NoMatchingFiles {
                        dir: source.display().to_string(),
                        extension: extension.clone(),
                    });
                }
                args.push("-".into());
                args.extend(files.into_iter().map(PathBuf::into_os_string));
            }
        }
        Ok(args)
    }
}

#[async_trait]
impl Launcher for ZipLauncher {
    async fn launch(&self, source: &Path) -> Result<ArchiveJob> {
        let args = self.args_for(source).await?;
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ZipStreamError::Launch {
                program: self.program_name(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ZipStreamError::Launch {
            program: self.program_name(),
            source: io::Error::other("failed to capture stdout"),
        })?;

        tracing::debug!(
            pid = ?child.id(),
            source = %source.display(),
            mode = ?self.mode,
            "archiver started"
        );

        let extension = match &self.mode {
            ArchiveMode::Filtered { extension } => Some(extension.clone()),
            ArchiveMode::Recursive => None,
        };
        Ok(ArchiveJob::new(
            source.to_path_buf(),
            extension,
            Box::new(ZipProcess { child, stdout }),
        ))
    }
}

/// Regular files directly under `dir` whose extension matches `ext`
/// case-insensitively, sorted by name. Symlinks are followed, as `zip -r` does.
pub fn matching_files(dir: &Path, ext: &str) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            // dangling link inside the directory, zip -r skips those too
            Err(e) if e.depth() > 0 => {
                tracing::debug!(error = %e, "skipping unreadable entry");
                continue;
            }
            Err(e) => return Err(io::Error::other(e)),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(ext));
        if matches {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

use crate::error::{Result, ZipStreamError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CHUNK_KIB: usize = 10;

/// Process-wide settings, built once at startup and shared read-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one sub-directory per archive id.
    pub root: PathBuf,
    /// Relay chunk size in KiB.
    pub chunk_kib: usize,
    /// Pause between chunk writes, in seconds. Zero or absent disables it.
    pub delay_secs: Option<f64>,
    /// Only archive files directly under the directory with this extension.
    pub extension: Option<String>,
    pub log_level: String,
    pub bind: SocketAddr,
    pub index_page: PathBuf,
    pub zip_program: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./test_photos"),
            chunk_kib: DEFAULT_CHUNK_KIB,
            delay_secs: None,
            extension: None,
            log_level: "info".to_string(),
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            index_page: PathBuf::from("index.html"),
            zip_program: PathBuf::from("zip"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_kib == 0 {
            return Err(ZipStreamError::Config(
                "chunk size must be a positive number of KiB".into(),
            ));
        }
        self.chunk_kib.checked_mul(1024).ok_or_else(|| {
            ZipStreamError::Config(format!("chunk size of {} KiB is too large", self.chunk_kib))
        })?;
        if let Some(d) = self.delay_secs {
            if !d.is_finite() || d < 0.0 {
                return Err(ZipStreamError::Config(format!(
                    "delay must be a non-negative number of seconds, got {d}"
                )));
            }
        }
        if let Some(ext) = &self.extension {
            if self.normalized_extension().is_none() || ext.contains(['/', '\\']) {
                return Err(ZipStreamError::Config(format!(
                    "invalid extension filter {ext:?}"
                )));
            }
        }
        Ok(())
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_kib.saturating_mul(1024)
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_secs
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Extension filter without a leading dot, e.g. `jpg` for `.JPG`.
    pub fn normalized_extension(&self) -> Option<String> {
        self.extension
            .as_deref()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
    }
}

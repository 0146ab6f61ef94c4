use crate::error::{Result, ZipStreamError};
use std::path::{Path, PathBuf};

/// Maps archive ids onto directories under a fixed root.
#[derive(Clone, Debug)]
pub struct ArchiveLocator {
    root: PathBuf,
}

impl ArchiveLocator {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            ZipStreamError::Config(format!("archive root {}: {e}", root.display()))
        })?;
        if !root.is_dir() {
            return Err(ZipStreamError::Config(format!(
                "archive root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `id` to an existing directory directly under the root.
    ///
    /// The check races with the filesystem: a directory removed after this
    /// returns surfaces later as a stream failure.
    pub async fn locate(&self, id: &str) -> Result<PathBuf> {
        let not_found = || ZipStreamError::NotFound { id: id.to_owned() };
        if !is_plain_name(id) {
            tracing::debug!(id, "rejecting archive id that is not a plain name");
            return Err(not_found());
        }

        let resolved = tokio::fs::canonicalize(self.root.join(id))
            .await
            .map_err(|_| not_found())?;
        // symlinks may point anywhere
        if !resolved.starts_with(&self.root) {
            tracing::warn!(id, path = %resolved.display(), "archive id escapes the root");
            return Err(not_found());
        }
        let md = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| not_found())?;
        if !md.is_dir() {
            return Err(not_found());
        }
        Ok(resolved)
    }
}

fn is_plain_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

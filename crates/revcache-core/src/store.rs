//! Content store: cached asset bytes on disk.
//!
//! # Layout
//!
//! ```text
//! <cache_root>/
//!   kcs2/img/common/common_itemicons.png      # blob for /kcs2/img/common/common_itemicons.png
//!   kcs2/img/common/common_itemicons.png.tmp  # only while a replacement is being written
//! ```

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use crate::error::{CacheError, CacheResult};
use crate::resource::ResourceKey;

/// Suffix of the staging file used during atomic replace.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Blob storage rooted at the cache directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Blob path for a key.
    pub fn path_for(&self, key: &ResourceKey) -> PathBuf {
        key.content_path(&self.root)
    }

    /// Whether a blob exists at `path`.
    pub async fn exists(&self, path: &Path) -> bool {
        fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Size on disk, `None` when the blob is missing.
    pub async fn len(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).await.ok().map(|m| m.len())
    }

    /// Read a whole blob.
    pub async fn read(&self, path: &Path) -> CacheResult<Bytes> {
        fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| CacheError::io(&format!("failed to read {}", path.display()), e))
    }

    /// Replace the blob at `path` so readers only ever see a complete file.
    pub async fn write_atomic(&self, path: &Path, content: &[u8]) -> CacheResult<()> {
        write_atomic(path, content).await
    }
}

/// Stage `content` next to `path` and rename it into place.
///
/// Every step before the rename touches only the staging file, so an
/// interrupted write leaves the previous blob intact.
pub async fn write_atomic(path: &Path, content: &[u8]) -> CacheResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::io("failed to create cache directory", e))?;
    }

    let temp_path = temp_path_for(path);

    if fs::try_exists(&temp_path).await.unwrap_or(false) {
        debug!(path = %temp_path.display(), "removing stray temp file");
        fs::remove_file(&temp_path)
            .await
            .map_err(|e| CacheError::io("failed to remove stray temp file", e))?;
    }

    fs::write(&temp_path, content)
        .await
        .map_err(|e| CacheError::io("failed to write temp file", e))?;

    // rename(2) replaces in place; Windows refuses to rename over an existing file.
    if cfg!(windows) && fs::try_exists(path).await.unwrap_or(false) {
        fs::remove_file(path)
            .await
            .map_err(|e| CacheError::io("failed to remove previous blob", e))?;
    }

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| CacheError::io("failed to rename temp file", e))?;

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

//! Storage backend trait and implementations.
//!
//! Registries, the cache and the loggers never touch `std::fs` for files
//! under the asset root; they go through a [`StorageBackend`] so that path
//! validation and atomic replacement are enforced in one place.

mod local;

pub use self::local::LocalBackend;
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use crate::path::temporary_sibling;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;

pub type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;

/// Unified interface over the asset tree.
///
/// All paths are relative to the backend root and are validated with
/// [`validate_path`](crate::validate_path) before use.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use wold_storage::{StorageBackend, error::Result, layout};
///
/// async fn metadata_size(backend: &dyn StorageBackend, kind: &str) -> Result<u64> {
///     let path = layout::metadata_file(kind);
///     match backend.exists(&path).await? {
///         true => Ok(backend.stat(&path).await?.size),
///         false => Ok(0),
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the backend, used for logging only.
    fn name(&self) -> &str;

    /// Absolute location of a relative path, for records that have to point
    /// at a file outside of this abstraction (e.g. `source_path`).
    fn resolve(&self, path: &Path) -> Result<PathBuf>;

    /// Inverse of [`resolve()`](Self::resolve): the relative path of an
    /// absolute location, if it lives under the root.
    fn relativize(&self, absolute: &Path) -> Option<PathBuf>;

    /// List all files below an optional prefix.
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<FileInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream file metadata below an optional prefix. A prefix that doesn't
    /// exist yields nothing rather than an error.
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read file contents. Returns [`NotFound`](ErrorKind::NotFound) if the
    /// file does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Create or overwrite a file, creating parent directories as needed.
    ///
    /// > **Note:** readers may observe a partially written file. Use
    /// > [`write_atomic()`](Self::write_atomic) for anything another
    /// > component might be reading.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Write to a hidden sibling first and rename it over `path`.
    ///
    /// Either the old contents or the new contents are visible at `path`,
    /// never a mix. The staging file is removed if the rename fails.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let staging = temporary_sibling(path);
        self.write(&staging, data).await?;
        if let Err(err) = self.rename(&staging, path).await {
            if let Err(cleanup) = self.delete(&staging).await {
                tracing::warn!(path = %staging.display(), error = ?cleanup, "Could not remove staging file");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Delete a file. Returns [`NotFound`](ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Delete a file, treating "already gone" as success. Returns whether
    /// something was actually removed.
    async fn remove_if_exists(&self, path: &Path) -> Result<bool> {
        match self.delete(path).await {
            Ok(()) => Ok(true),
            Err(err) if matches!(&*err, ErrorKind::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Rename a file within the backend, overwriting the destination and
    /// creating its parent directories as needed.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// File metadata without reading contents.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;
}

impl std::fmt::Debug for dyn StorageBackend + Send + Sync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBackend").field("name", &self.name()).finish_non_exhaustive()
    }
}

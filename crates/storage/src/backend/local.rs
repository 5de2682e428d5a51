//! Local filesystem storage backend.
//!
//! Files live under a root directory (normally `assets/`) and are accessed
//! via `tokio::fs`.

use crate::backend::FileInfoStream;
use crate::error::{ErrorKind, Result};
use crate::{FileInfo, StorageBackend, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncWriteExt;

enum WalkEntry {
    File(FileInfo),
    Descend(PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use wold_storage::LocalBackend;
///
/// # fn example() -> wold_storage::error::Result<()> {
/// let backend = LocalBackend::new("assets", "/srv/wold/assets")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    name: String,
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend rooted at an absolute directory,
    /// creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if the path is relative
    /// or points at something that isn't a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Only happens once at startup; not worth an async constructor.
            sync_create_dir(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    fn file_info(path: &Path, metadata: Metadata) -> Result<FileInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(FileInfo::new(path, metadata.len(), modified))
    }

    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::from_io(e, &path))?;
        let relative = self.relative_path(&path)?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        // Staging files from in-flight atomic writes are not real files yet.
        if relative.file_name().map(|n| n.to_string_lossy()).is_some_and(|n| n.starts_with('.') && n.ends_with(".tmp")) {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(Self::file_info(&relative, metadata)?));
        }
        // Most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        self.absolute_path(path)
    }

    fn relativize(&self, absolute: &Path) -> Option<PathBuf> {
        self.relative_path(absolute).ok()
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        // The prefix may name a file or a directory that doesn't exist yet, so
        // walk from its parent and filter component-wise.
        let start_dir = validated_prefix
            .as_ref()
            .map(|prefix| self.root.join(prefix).parent().unwrap_or(&self.root).to_path_buf())
            .unwrap_or_else(|| self.root.clone());
        let mut stack = vec![start_dir];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::from_io(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(ErrorKind::from_io(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d)) => stack.push(d),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, path))?;
        }
        Ok(fs::write(&abs_path, data).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let target = self.absolute_path(path)?;
        let staging = self.absolute_path(crate::temporary_sibling(path))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, path))?;
        }
        let staged: std::io::Result<()> = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(data).await?;
            // Data has to be on disk before the rename publishes it.
            file.sync_all().await?;
            fs::rename(&staging, &target).await
        }
        .await;
        if let Err(err) = staged {
            if let Err(cleanup) = fs::remove_file(&staging).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %staging.display(), error = %cleanup, "Could not remove staging file");
            }
            exn::bail!(ErrorKind::from_io(err, path));
        }
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.absolute_path(from)?;
        let to_path = self.absolute_path(to)?;
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, to))?;
        }
        Ok(fs::rename(&from_path, &to_path).await.map_err(|e| ErrorKind::from_io(e, from))?)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Self::file_info(path, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("assets", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("assets", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("assets", "relative/path").is_err());
    }

    #[test]
    fn test_resolve_and_relativize() {
        let (temp_dir, backend) = backend();
        let abs = backend.resolve(Path::new("models/cube.glb")).unwrap();
        assert_eq!(abs, temp_dir.path().join("models/cube.glb"));
        assert_eq!(backend.relativize(&abs).unwrap(), Path::new("models/cube.glb"));
        assert!(backend.relativize(Path::new("/elsewhere/cube.glb")).is_none());
        assert!(backend.resolve(Path::new("../etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_temp_dir, backend) = backend();
        backend.write(Path::new("a/b/test.txt"), b"Hello").await.unwrap();
        assert_eq!(backend.read(Path::new("a/b/test.txt")).await.unwrap(), b"Hello");
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_and_leaves_no_staging_files() {
        let (_temp_dir, backend) = backend();
        let path = Path::new("models/metadata/models_metadata.json");
        backend.write_atomic(path, b"{}").await.unwrap();
        backend.write_atomic(path, br#"{"cube":{}}"#).await.unwrap();
        assert_eq!(backend.read(path).await.unwrap(), br#"{"cube":{}}"#);
        let files = backend.list(Some(Path::new("models"))).await.unwrap();
        assert_eq!(files.len(), 1);
        let leftovers = std::fs::read_dir(backend.resolve(Path::new("models/metadata")).unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let (_temp_dir, backend) = backend();
        backend.write(Path::new("models/data/a.json"), b"{}").await.unwrap();
        backend.write(Path::new("models/data/b.json"), b"{}").await.unwrap();
        backend.write(Path::new("models/database.json"), b"{}").await.unwrap();
        backend.write(Path::new("textures/data/c.json"), b"{}").await.unwrap();
        assert_eq!(backend.list(None).await.unwrap().len(), 4);
        let data = backend.list(Some(Path::new("models/data"))).await.unwrap();
        assert_eq!(data.len(), 2);
        assert!(backend.list(Some(Path::new("nonexistent/"))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_and_remove_if_exists() {
        let (_temp_dir, backend) = backend();
        backend.write(Path::new("file.txt"), b"data").await.unwrap();
        backend.delete(Path::new("file.txt")).await.unwrap();
        let err = backend.delete(Path::new("file.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        assert!(!backend.remove_if_exists(Path::new("file.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_creates_directories() {
        let (_temp_dir, backend) = backend();
        backend.write(Path::new("file.txt"), b"data").await.unwrap();
        backend.rename(Path::new("file.txt"), Path::new("a/b/c/file.txt")).await.unwrap();
        assert!(!backend.exists(Path::new("file.txt")).await.unwrap());
        assert_eq!(backend.read(Path::new("a/b/c/file.txt")).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_stat() {
        let (_temp_dir, backend) = backend();
        backend.write(Path::new("file.txt"), b"Hello, world!").await.unwrap();
        let info = backend.stat(Path::new("file.txt")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("file.txt"));
        assert_eq!(info.size, 13);
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_temp_dir, backend) = backend();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.write(Path::new("../etc/passwd"), b"data").await.is_err());
        assert!(backend.delete(Path::new("../../file")).await.is_err());
    }
}

//! Content hashing with a fingerprint cache.
//!
//! [`HashIndex`] hands out lowercase hex SHA-256 digests of files. Digests are
//! remembered against the file's (canonical path, mtime, size) so that asking
//! twice about an untouched file only costs a `stat`. From the outside it
//! behaves like a pure function of the file contents.

use crate::error::{ErrorKind, Result};
use crate::file::{FileInfo, FileMeta, Hashed};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::instrument;

/// Files are streamed through the hasher in blocks of this many bytes.
pub const BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    modified: SystemTime,
    size: u64,
}

#[derive(Debug)]
pub struct HashIndex {
    block_size: usize,
    known: Mutex<HashMap<PathBuf, (Fingerprint, String)>>,
}
impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}
impl HashIndex {
    pub fn new() -> Self {
        Self::with_block_size(BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            known: Mutex::new(HashMap::new()),
        }
    }

    /// SHA-256 of the file at `path` as lowercase hex.
    ///
    /// # Errors
    /// [`NotFound`](ErrorKind::NotFound) or [`PermissionDenied`](ErrorKind::PermissionDenied)
    /// when the file can't be opened, [`InvalidPath`](ErrorKind::InvalidPath) when
    /// it isn't a regular file, [`Io`](ErrorKind::Io) for anything else.
    pub async fn hash_of(&self, path: impl AsRef<Path>) -> Result<String> {
        Ok(self.hash_file(path).await?.content_hash)
    }

    /// Same as [`hash_of()`](Self::hash_of) but keeps the size and mtime that
    /// were observed alongside the digest. The returned path is canonical.
    #[instrument(skip_all, fields(path = %path.as_ref().display(), cached = tracing::field::Empty))]
    pub async fn hash_file(&self, path: impl AsRef<Path>) -> Result<FileInfo<Hashed>> {
        let path = path.as_ref();
        let absolute = fs::canonicalize(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        let metadata = fs::metadata(&absolute).await.map_err(|e| ErrorKind::from_io(e, &absolute))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::InvalidPath(absolute));
        }
        let modified = metadata.modified().map_err(ErrorKind::Io)?;
        let fingerprint = Fingerprint { modified, size: metadata.len() };
        let meta = FileMeta {
            path: absolute.clone(),
            size: fingerprint.size,
            modified: modified.into(),
        };

        let cached = self.known.lock().get(&absolute).filter(|(seen, _)| *seen == fingerprint).map(|(_, h)| h.clone());
        tracing::Span::current().record("cached", cached.is_some());
        if let Some(hash) = cached {
            return Ok(meta.with_hash(hash));
        }

        let hash = self.digest(&absolute).await?;
        self.known.lock().insert(absolute, (fingerprint, hash.clone()));
        Ok(meta.with_hash(hash))
    }

    async fn digest(&self, path: &Path) -> Result<String> {
        let mut file = fs::File::open(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        let mut hasher = Sha256::new();
        let mut block = vec![0u8; self.block_size];
        loop {
            let read = file.read(&mut block).await.map_err(ErrorKind::Io)?;
            if read == 0 {
                break;
            }
            hasher.update(&block[..read]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Digest of bytes that are already in memory.
    pub fn hash_bytes(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Drop whatever is remembered about `path`. The next lookup rehashes.
    pub fn forget(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.known.lock().remove(&key);
    }

    /// Number of remembered digests.
    pub fn len(&self) -> usize {
        self.known.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! File metadata as seen by the storage layer and the hash index.

use std::ops::Deref;
use std::path::PathBuf;
use time::OffsetDateTime;

// A listing yields `FileInfo<Discovered>`; only the hash index hands out
// `FileInfo<Hashed>`, so a digest can't be attached to a file by accident.

/// Size and modification time of a file, independent of its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Relative to the asset root for backend listings, absolute for files
    /// hashed in place.
    pub path: PathBuf,
    pub size: u64,
    pub modified: OffsetDateTime,
}
impl FileMeta {
    pub(crate) fn with_hash(self, hash: impl Into<String>) -> FileInfo<Hashed> {
        FileInfo { meta: self, content_hash: hash.into() }
    }
}

mod sealed {
    pub trait Sealed {}
}
pub trait HashState: sealed::Sealed {
    type Hash;
}

/// Found by a listing; contents never read.
pub struct Discovered;
impl sealed::Sealed for Discovered {}
impl HashState for Discovered {
    type Hash = ();
}

pub struct Hashed;
impl sealed::Sealed for Hashed {}
impl HashState for Hashed {
    type Hash = String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo<S: HashState = Discovered> {
    meta: FileMeta,
    /// Lowercase hex SHA-256 of the raw file bytes.
    pub content_hash: S::Hash,
}
impl<S: HashState> FileInfo<S> {
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }
}
impl<S: HashState> Deref for FileInfo<S> {
    type Target = FileMeta;
    fn deref(&self) -> &FileMeta {
        &self.meta
    }
}

impl FileInfo {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self { meta: FileMeta { path: path.into(), size, modified }, content_hash: () }
    }
}

//! Cache Error Types
//!
//! The index is a metadata store and the files live behind a storage
//! backend, so most of these wrap an error from one of those two crates.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The file handed to the cache doesn't exist.
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Reading, writing or removing a cache file failed.
    #[display("cache file I/O failed: {}", _0.display())]
    File(#[error(not(source))] PathBuf),
    /// The cache index couldn't be read or written.
    #[display("cache index error")]
    Index,
    /// A logical name that can't be turned into a cache file name.
    #[display("invalid cache name: {_0:?}")]
    InvalidName(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::File(_) | Self::Index)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

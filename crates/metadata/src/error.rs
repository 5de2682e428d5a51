//! Metadata Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A metadata store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for metadata store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The document on disk exists but can't be understood. The store refuses
    /// to open rather than start over with an empty map and lose data.
    #[display("metadata store is corrupt: {}", _0.display())]
    StoreCorrupt(#[error(not(source))] PathBuf),
    /// Reading or writing the document failed.
    #[display("metadata store I/O failed: {}", _0.display())]
    Storage(#[error(not(source))] PathBuf),
    /// A record couldn't be turned into JSON.
    #[display("record could not be serialized: {_0}")]
    Serialize(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

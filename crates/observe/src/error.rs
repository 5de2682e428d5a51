//! Observability Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// An observability error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for log, ledger and bus operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A log file couldn't be opened, written, rotated or compressed.
    #[display("log file error: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// A metadata store (log records, error ledger) failed.
    #[display("observability store error")]
    Store,
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The request itself was malformed, e.g. an empty resolution.
    #[display("invalid argument: {_0}")]
    InvalidArgument(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Store)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

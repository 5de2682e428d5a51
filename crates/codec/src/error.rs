//! Codec Error Types
//!
//! Decoders and transformations are pure functions of their input, so none
//! of these are worth retrying with the same bytes.

use derive_more::{Display, Error};

/// A codec error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No decoder or encoder exists for this format.
    #[display("unsupported format: {_0}")]
    Unsupported(#[error(not(source))] String),
    /// The bytes claim to be a known format but don't hold together.
    #[display("malformed {_0}")]
    Malformed(#[error(not(source))] String),
    /// A transformation parameter is out of range for this input.
    #[display("invalid argument: {_0}")]
    InvalidArgument(#[error(not(source))] String),
    /// Encoding the result failed.
    #[display("could not encode {_0}")]
    Encode(#[error(not(source))] &'static str),
}

impl ErrorKind {
    pub fn malformed(what: impl Into<String>) -> Self {
        Self::Malformed(what.into())
    }

    pub fn is_retryable(&self) -> bool {
        false
    }
}

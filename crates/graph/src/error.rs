//! Graph Error Types

use derive_more::{Display, Error};

/// A dependency graph error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for dependency graph operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No registered node by that name.
    #[display("dependency not registered: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The change would break a graph rule, e.g. close a cycle or orphan a
    /// dependent.
    #[display("dependency constraint violated: {_0}")]
    Constraint(#[error(not(source))] String),
    /// The persisted graph couldn't be read or written.
    #[display("dependency store error")]
    Store,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

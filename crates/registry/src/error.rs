//! Registry Error Types
//!
//! Every registry operation returns one of these kinds. The lower crates'
//! errors end up as children in the `exn` tree, so the kind says what went
//! wrong at this level and the tree says where it started.
//!
//! [`Io`](ErrorKind::Io), [`Decode`](ErrorKind::Decode),
//! [`Store`](ErrorKind::Store) and [`Pipeline`](ErrorKind::Pipeline) are
//! copied into the error ledger before they reach the caller; the others
//! are expected outcomes of bad input and are not.

use derive_more::{Display, Error};
use std::path::PathBuf;
use std::sync::Arc;
use wold_observe::{ErrorManager, ErrorReport};

/// A registry error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A file was missing, unreadable or unwritable.
    #[display("I/O failed: {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// A file can't be parsed as its declared kind.
    #[display("could not decode {_0}")]
    Decode(#[error(not(source))] String),
    /// A metadata document (or the cache index or graph behind it) couldn't
    /// be read or written.
    #[display("metadata store failed for {_0}")]
    Store(#[error(not(source))] String),
    /// The request breaks a rule: a setting outside its constraints, a
    /// dependency cycle, deleting something still in use.
    #[display("constraint violated: {_0}")]
    Constraint(#[error(not(source))] String),
    /// A transformation step failed.
    #[display("pipeline step failed: {_0}")]
    Pipeline(#[error(not(source))] String),
    /// A pipeline job was cancelled between two steps.
    #[display("pipeline job cancelled: {_0}")]
    Cancelled(#[error(not(source))] String),
    /// No record under that name.
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Store(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }

    /// Error type under which this kind is kept in the ledger, or `None` for
    /// kinds that are never recorded.
    pub fn ledger_type(&self) -> Option<&'static str> {
        match self {
            Self::Io(_) => Some("IO"),
            Self::Decode(_) => Some("DECODE"),
            Self::Store(_) => Some("STORE"),
            Self::Pipeline(_) => Some("PIPELINE"),
            Self::Constraint(_) | Self::Cancelled(_) | Self::NotFound(_) => None,
        }
    }
}

/// Copies failures into the error ledger on their way out.
#[derive(Debug, Clone)]
pub(crate) struct Ledger {
    errors: Arc<ErrorManager>,
}

impl Ledger {
    pub fn new(errors: Arc<ErrorManager>) -> Self {
        Self { errors }
    }

    /// Pass `result` through, recording it first when it is a ledger-worthy
    /// failure. A ledger that can't be written only costs a warning.
    pub async fn track<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        let Err(err) = &result else {
            return result;
        };
        let kind: &ErrorKind = err;
        if let Some(error_type) = kind.ledger_type() {
            let report = ErrorReport::new(error_type, kind.to_string())
                .context("operation", operation)
                .stack_trace(format!("{err:?}"));
            if let Err(ledger) = self.errors.record(report).await {
                tracing::warn!(operation, error = ?ledger, "Could not record error in the ledger");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::Io(PathBuf::from("a")), Some("IO"))]
    #[case(ErrorKind::Decode("cube".into()), Some("DECODE"))]
    #[case(ErrorKind::Store("model".into()), Some("STORE"))]
    #[case(ErrorKind::Pipeline("lod".into()), Some("PIPELINE"))]
    #[case(ErrorKind::Constraint("cycle".into()), None)]
    #[case(ErrorKind::Cancelled("lod".into()), None)]
    #[case(ErrorKind::NotFound("cube".into()), None)]
    fn test_ledger_type(#[case] kind: ErrorKind, #[case] expected: Option<&str>) {
        assert_eq!(kind.ledger_type(), expected);
    }
}

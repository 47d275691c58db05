//! Error types for eventws-core.

use thiserror::Error;

/// Result type alias for eventws operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for event storage operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The caller supplied a nonsensical parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// On-disk metadata disagrees with the backing file.
    #[error("corrupt store: {0}")]
    CorruptStore(String),

    /// The operation is structurally unsupported for this representation.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A cancellation request was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error was raised by a cancellation request.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

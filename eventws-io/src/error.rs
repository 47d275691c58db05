//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory mapping error.
    #[error("memory mapping error: {0}")]
    MmapError(String),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// A block descriptor points past the data actually present in the file.
    #[error("corrupt store: block at record {offset} with {records} records exceeds file of {available} records")]
    CorruptStore {
        /// Block offset in records.
        offset: u64,
        /// Block length in records.
        records: u64,
        /// Whole records physically present in the file.
        available: u64,
    },

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] eventws_core::Error),
}

impl From<Error> for eventws_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io) => Self::Io(io),
            Error::CoreError(core) => core,
            Error::CorruptStore { .. } => Self::CorruptStore(err.to_string()),
            Error::MmapError(msg) | Error::InvalidFormat(msg) => Self::InvalidArgument(msg),
        }
    }
}

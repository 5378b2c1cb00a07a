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

    /// Invalid or truncated file content.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// `read_frame` was called while a record was only partly consumed.
    #[error("{remaining} clusters of the current record are still unread")]
    PartialRecord {
        /// Clusters left in the current record.
        remaining: u32,
    },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] clusterpix_core::Error),

    /// Pipeline or sink error.
    #[error("algorithm error: {0}")]
    AlgorithmError(#[from] clusterpix_algorithms::Error),
}

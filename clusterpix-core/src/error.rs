//! Error types for clusterpix-core.

use thiserror::Error;

/// Result type alias for clusterpix operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for clusterpix operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A frame or array does not have the expected `(rows, cols)` shape.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// A raw cluster payload does not hold exactly `W * H` values.
    #[error("invalid payload length: expected {expected} values, got {actual}")]
    InvalidPayloadLength { expected: usize, actual: usize },

    /// A frame holds a NaN or infinite pixel value.
    #[error("pixel ({row}, {col}) is not finite")]
    NonFinite { row: usize, col: usize },

    /// Pixel or element index outside the valid range.
    #[error("index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    /// Bin edges are too short or not monotonically increasing.
    #[error("invalid bin edges: {0}")]
    InvalidBinEdges(String),

    /// Array layout error while building an `ndarray` view.
    #[error("array layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

//! Error types for the finder pipeline and interpolator.

use thiserror::Error;

/// Result type for clusterpix-algorithms operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by finders, the pipeline, sinks and the interpolator.
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error (shape mismatch, invalid bins, ...).
    #[error("core error: {0}")]
    CoreError(#[from] clusterpix_core::Error),

    /// The pipeline must be running for this operation.
    #[error("pipeline is not running")]
    NotRunning,

    /// The pipeline must be stopped for this operation.
    #[error("pipeline is running; stop it first")]
    Running,

    /// Worker index outside the pool.
    #[error("worker {index} does not exist (pool has {workers} workers)")]
    WorkerIndex {
        /// Requested worker.
        index: usize,
        /// Pool size.
        workers: usize,
    },

    /// A sink was asked for its results before being stopped.
    #[error("sink is still running; stop it first")]
    SinkRunning,

    /// A worker or sink thread panicked.
    #[error("thread {0} panicked")]
    ThreadPanicked(String),

    /// A worker or sink thread could not be spawned.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

//! Error types for ship operations.

use thiserror::Error;

/// Result type alias for ship operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Ship operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection establishment failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The ship is closed; no further loads or unloads are possible.
    #[error("ship closed: {0}")]
    Closed(String),

    /// An I/O error on the underlying transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

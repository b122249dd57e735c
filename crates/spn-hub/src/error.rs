//! Error types for hub data handling.

use thiserror::Error;

/// Result type alias for hub data handling.
pub type Result<T> = core::result::Result<T, Error>;

/// Hub data errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A transport address could not be parsed.
    #[error("invalid transport: {0}")]
    InvalidTransport(String),

    /// A hub ID is not a valid labeled hash.
    #[error("invalid hub ID: {0}")]
    InvalidHubId(String),

    /// A signature check failed.
    #[error("invalid signature on {0}")]
    InvalidSignature(&'static str),

    /// A document did not match its signing identity.
    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),

    /// A document could not be decoded.
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// A document could not be encoded.
    #[error("failed to serialize document: {0}")]
    Serialization(String),

    /// No usable exchange key is available.
    #[error("no usable exchange key: {0}")]
    NoExchangeKey(String),
}

//! Error types for the access token subsystem.

use thiserror::Error;

/// Result type alias for token handling.
pub type Result<T> = core::result::Result<T, Error>;

/// Token handling errors.
///
/// All of these are non-fatal to the wider system; they surface to the
/// access layer only.
#[derive(Debug, Error)]
pub enum Error {
    /// The token does not parse or carries invalid fields.
    #[error("token malformed: {0}")]
    TokenMalformed(String),

    /// The token's signature does not verify.
    #[error("token invalid")]
    TokenInvalid,

    /// The token was already spent.
    #[error("token already used: {0}")]
    TokenUsed(String),

    /// No tokens left in storage.
    #[error("no tokens available")]
    Empty,

    /// The token belongs to a different zone.
    #[error("zone mismatch")]
    ZoneMismatch,

    /// A batch message had the wrong number of slots.
    #[error("batch size mismatch: {0}")]
    BatchMismatch(String),

    /// A batch message slot was empty.
    #[error("missing batch data #{0}")]
    MissingSlot(usize),

    /// The configured curve has no implementation.
    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),

    /// A key could not be decoded.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Protocol state was used out of order.
    #[error("protocol state error: {0}")]
    ProtocolState(String),
}

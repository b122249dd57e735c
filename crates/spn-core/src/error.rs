//! Error types for protocol operations.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Protocol operation errors.
///
/// Every variant that can travel in a Stop frame has a stable wire code;
/// see [`Error::code`] and [`Error::from_code`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Orderly shutdown in progress; callers must quit (0x01).
    #[error("operation is stopping")]
    Stopping,

    /// Handshake step or operation exceeded its deadline (0x02).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Parse failure; fatal during handshake, per-terminal otherwise (0x03).
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// Decryption or authentication failure; fatal (0x04).
    #[error("integrity violated: {0}")]
    Integrity(String),

    /// Remote hub lacks a usable exchange key (0x05).
    #[error("hub not ready: {0}")]
    HubNotReady(String),

    /// Programmer error, e.g. missing identity on the accept side (0x06).
    #[error("incorrect usage: {0}")]
    IncorrectUsage(String),

    /// Unreachable-in-theory condition; fatal (0x07).
    #[error("internal error: {0}")]
    InternalError(String),

    /// Peer violated flow control; fatal for the terminal (0x08).
    #[error("queue overflowed")]
    QueueOverflow,

    /// Ephemeral congestion, e.g. a concurrent test already running (0x09).
    #[error("try again later: {0}")]
    TryAgainLater(String),

    /// Underlying transport failed; fatal for the crane (0x0A).
    #[error("ship sunk: {0}")]
    ShipSunk(String),

    /// Error code received on the wire that this build does not know.
    #[error("unknown error (code {0:#04x})")]
    Unknown(u8),
}

impl Error {
    /// Wire code carried in Stop frames.
    pub fn code(&self) -> u8 {
        match self {
            Error::Unknown(code) => *code,
            Error::Stopping => 0x01,
            Error::Timeout(_) => 0x02,
            Error::MalformedData(_) => 0x03,
            Error::Integrity(_) => 0x04,
            Error::HubNotReady(_) => 0x05,
            Error::IncorrectUsage(_) => 0x06,
            Error::InternalError(_) => 0x07,
            Error::QueueOverflow => 0x08,
            Error::TryAgainLater(_) => 0x09,
            Error::ShipSunk(_) => 0x0A,
        }
    }

    /// Reconstruct an error from a wire code.
    ///
    /// Context strings do not travel on the wire, so reconstructed
    /// errors carry an empty context.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Error::Stopping,
            0x02 => Error::Timeout(String::new()),
            0x03 => Error::MalformedData(String::new()),
            0x04 => Error::Integrity(String::new()),
            0x05 => Error::HubNotReady(String::new()),
            0x06 => Error::IncorrectUsage(String::new()),
            0x07 => Error::InternalError(String::new()),
            0x08 => Error::QueueOverflow,
            0x09 => Error::TryAgainLater(String::new()),
            0x0A => Error::ShipSunk(String::new()),
            other => Error::Unknown(other),
        }
    }

    /// Whether this error is part of an orderly shutdown rather than a fault.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Error::Stopping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        let errors = [
            Error::Stopping,
            Error::Timeout("x".into()),
            Error::MalformedData("x".into()),
            Error::Integrity("x".into()),
            Error::HubNotReady("x".into()),
            Error::IncorrectUsage("x".into()),
            Error::InternalError("x".into()),
            Error::QueueOverflow,
            Error::TryAgainLater("x".into()),
            Error::ShipSunk("x".into()),
        ];
        for err in errors {
            let code = err.code();
            assert_eq!(Error::from_code(code).code(), code);
        }
    }

    #[test]
    fn unknown_code_is_preserved() {
        let err = Error::from_code(0x7F);
        assert_eq!(err, Error::Unknown(0x7F));
        assert_eq!(err.code(), 0x7F);
    }
}

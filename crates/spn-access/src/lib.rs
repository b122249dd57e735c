//! Privacy-preserving access tokens.
//!
//! Tokens are partially-blind signatures over a random nonce: the issuer
//! signs without seeing the nonce, so presented tokens cannot be linked
//! back to their issuance, while the public "info" part (zone and
//! optional serial) stays bound into every signature. Issuance runs as a
//! batched three-message exchange; verification is local and cheap.
//!
//! The signature scheme itself is externally defined and consumed
//! through the [`scheme`] seam; the handler owns only the batching,
//! serialization, and verification glue around it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handler;
pub mod pblind;
pub mod scheme;

pub use error::{Error, Result};
pub use handler::{PBlindHandler, PBlindOptions, PBlindToken, Token};
pub use pblind::{CurveId, PBlindPublicKey, PBlindSecretKey, PBlindSignature};

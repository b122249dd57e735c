//! Cryptographic primitives for the SPN transport substrate.
//!
//! This crate provides the building blocks the crane handshake and channel
//! encryption are assembled from:
//! - ChaCha20-Poly1305 AEAD with counter nonces
//! - HKDF-SHA256 key derivation for directional channel keys
//! - X25519 key exchange (ephemeral and exchange-key pairs)
//! - The symmetric channel session established by the handshake
//!
//! All private keys and shared secrets are wrapped in `Zeroizing` so they
//! are cleared from memory when dropped.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod kex;
pub mod session;

pub use error::{Error, Result};
pub use kex::ExchangeKeyPair;
pub use session::EncryptionSession;

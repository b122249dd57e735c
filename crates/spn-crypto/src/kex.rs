//! X25519 key exchange (RFC 7748).
//!
//! Hubs publish X25519 exchange keys ("signets") in their status; a crane
//! handshake pairs a fresh ephemeral key on the initiating side with the
//! acceptor's published exchange key.

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// An X25519 key pair held by a hub identity or a handshake.
///
/// The private scalar is zeroed on drop.
pub struct ExchangeKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ExchangeKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Build a key pair from a raw private scalar.
    ///
    /// Primarily for tests with known vectors.
    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public key as a 32-byte array.
    pub fn public_key(&self) -> &[u8; 32] {
        self.public.as_bytes()
    }

    /// Compute the shared secret with a peer's public key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyExchange`] for low-order peer points, which
    /// produce an all-zero shared secret.
    pub fn exchange(&self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if shared.as_bytes() == &[0u8; 32] {
            return Err(Error::KeyExchange(
                "invalid peer public key (low-order point)".into(),
            ));
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

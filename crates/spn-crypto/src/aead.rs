//! Authenticated encryption (ChaCha20-Poly1305, RFC 8439).
//!
//! Channel payloads are sealed with a per-direction key and a counter
//! nonce. Nonces must never repeat under one key; the channel session
//! guarantees this by deriving fresh keys per handshake and counting
//! monotonically.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Construct a 12-byte AEAD nonce from a message counter.
///
/// The first 4 bytes are zero, the remaining 8 carry the counter in
/// little-endian order.
pub fn construct_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt `plaintext` and return ciphertext with the appended 16-byte tag.
///
/// `aad` is authenticated but not encrypted.
pub fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Encryption("ChaCha20-Poly1305 encryption failed".into()))
}

/// Decrypt and authenticate `ciphertext_and_tag`.
///
/// # Errors
///
/// Returns [`Error::Decryption`] if tag verification fails.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext_and_tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext_and_tag,
                aad,
            },
        )
        .map_err(|_| Error::Decryption("ChaCha20-Poly1305 authentication failed".into()))?;
    Ok(Zeroizing::new(plaintext))
}

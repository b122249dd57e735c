//! Symmetric channel session established by the crane handshake.
//!
//! After the handshake, each crane direction owns one key and one
//! monotonically increasing message counter. The underlying bytestream is
//! ordered and lossless, so counters advance in lockstep on both sides and
//! never travel on the wire.
//!
//! The initiating side's first sealed payload travels inside a "letter":
//! its ephemeral public key followed by the ciphertext. The accepting side
//! reconstructs the session from the letter and its exchange secret.

use std::sync::atomic::{AtomicU64, Ordering};

use zeroize::Zeroizing;

use crate::aead::{construct_nonce, open, seal};
use crate::kdf::derive_channel_keys;
use crate::kex::ExchangeKeyPair;
use crate::{Error, Result};

/// Established channel encryption state.
pub struct EncryptionSession {
    tx_key: Zeroizing<[u8; 32]>,
    rx_key: Zeroizing<[u8; 32]>,
    tx_counter: AtomicU64,
    rx_counter: AtomicU64,
}

impl EncryptionSession {
    /// Initiate a session against the peer's published exchange key.
    ///
    /// Returns the session and the local ephemeral public key that must be
    /// placed in the letter so the peer can derive the same session.
    pub fn initiate(peer_signet: &[u8; 32]) -> Result<(Self, [u8; 32])> {
        let ephemeral = ExchangeKeyPair::generate();
        let shared = ephemeral.exchange(peer_signet)?;
        let (tx_key, rx_key) = derive_channel_keys(&*shared, ephemeral.public_key(), peer_signet)?;

        Ok((
            Self {
                tx_key,
                rx_key,
                tx_counter: AtomicU64::new(0),
                rx_counter: AtomicU64::new(0),
            },
            *ephemeral.public_key(),
        ))
    }

    /// Accept a session from the initiator's ephemeral public key.
    ///
    /// `exchange` is the local exchange key pair whose public half the
    /// initiator encrypted against.
    pub fn accept(exchange: &ExchangeKeyPair, initiator_ephemeral: &[u8; 32]) -> Result<Self> {
        let shared = exchange.exchange(initiator_ephemeral)?;
        let (to_acceptor, to_initiator) =
            derive_channel_keys(&*shared, initiator_ephemeral, exchange.public_key())?;

        // Directions are mirrored on this side.
        Ok(Self {
            tx_key: to_initiator,
            rx_key: to_acceptor,
            tx_counter: AtomicU64::new(0),
            rx_counter: AtomicU64::new(0),
        })
    }

    /// Seal one outgoing payload.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        seal(&self.tx_key, &construct_nonce(counter), plaintext, &[])
    }

    /// Open one incoming payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decryption`] on any authentication failure; the
    /// channel must be torn down in that case, the receive counter is
    /// already spent.
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.rx_counter.fetch_add(1, Ordering::SeqCst);
        let plaintext = open(&self.rx_key, &construct_nonce(counter), ciphertext, &[])?;
        Ok(plaintext.to_vec())
    }
}

/// Build the letter the initiator sends with its first sealed payload.
pub fn compose_letter(ephemeral_public: &[u8; 32], ciphertext: &[u8]) -> Vec<u8> {
    let mut letter = Vec::with_capacity(32 + ciphertext.len());
    letter.extend_from_slice(ephemeral_public);
    letter.extend_from_slice(ciphertext);
    letter
}

/// Split a letter into the ephemeral public key and the ciphertext.
pub fn parse_letter(letter: &[u8]) -> Result<([u8; 32], &[u8])> {
    if letter.len() < 32 {
        return Err(Error::Decryption("letter too short".into()));
    }
    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&letter[..32]);
    Ok((ephemeral, &letter[32..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (EncryptionSession, EncryptionSession) {
        let exchange = ExchangeKeyPair::generate();
        let (initiator, ephemeral) = EncryptionSession::initiate(exchange.public_key()).unwrap();
        let acceptor = EncryptionSession::accept(&exchange, &ephemeral).unwrap();
        (initiator, acceptor)
    }

    #[test]
    fn both_directions_round_trip() {
        let (initiator, acceptor) = session_pair();

        for i in 0..5u8 {
            let msg = vec![i; 20];
            let sealed = initiator.seal(&msg).unwrap();
            assert!(sealed.len() > msg.len());
            assert_eq!(acceptor.open(&sealed).unwrap(), msg);

            let reply = vec![i ^ 0xFF; 33];
            let sealed = acceptor.seal(&reply).unwrap();
            assert_eq!(initiator.open(&sealed).unwrap(), reply);
        }
    }

    #[test]
    fn counters_must_stay_in_lockstep() {
        let (initiator, acceptor) = session_pair();

        let first = initiator.seal(b"one").unwrap();
        let second = initiator.seal(b"two").unwrap();

        // Opening out of order fails authentication.
        assert!(acceptor.open(&second).is_err());
        // The receive counter is spent, even the right message fails now.
        assert!(acceptor.open(&first).is_err());
    }

    #[test]
    fn letter_round_trip() {
        let ephemeral = [0xABu8; 32];
        let letter = compose_letter(&ephemeral, b"ciphertext");
        let (parsed, ct) = parse_letter(&letter).unwrap();
        assert_eq!(parsed, ephemeral);
        assert_eq!(ct, b"ciphertext");

        assert!(parse_letter(&[0u8; 16]).is_err());
    }
}

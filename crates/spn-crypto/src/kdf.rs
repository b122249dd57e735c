//! Key derivation (HKDF-SHA256, RFC 5869).

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Directional channel keys: (initiator-to-acceptor, acceptor-to-initiator).
pub type ChannelKeys = (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>);

/// Generic HKDF-SHA256 derivation.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".into()))?;
    Ok(Zeroizing::new(okm))
}

/// Derive the directional channel keys for a crane session.
///
/// Both sides call this with the same arguments: the X25519 shared
/// secret, the initiator's ephemeral public key, and the acceptor's
/// exchange public key. The 64-byte expand is split into one key per
/// direction.
pub fn derive_channel_keys(
    shared_secret: &[u8],
    initiator_public: &[u8; 32],
    acceptor_public: &[u8; 32],
) -> Result<ChannelKeys> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(initiator_public);
    salt.extend_from_slice(acceptor_public);

    let okm = hkdf_sha256(shared_secret, &salt, b"spn-channel-keys", 64)?;

    let mut tx = [0u8; 32];
    let mut rx = [0u8; 32];
    tx.copy_from_slice(&okm[0..32]);
    rx.copy_from_slice(&okm[32..64]);
    Ok((Zeroizing::new(tx), Zeroizing::new(rx)))
}

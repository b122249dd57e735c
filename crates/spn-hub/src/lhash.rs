//! Labeled hashes — algorithm-tagged digests with a base58 text form.
//!
//! Hub IDs are labeled hashes of the hub's identity verifying key. The
//! algorithm tag byte precedes the digest so the scheme can rotate without
//! changing the ID format.

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Algorithm tag for SHA-256.
const SCHEME_SHA256: u8 = 1;

/// An algorithm-tagged digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledHash {
    scheme: u8,
    digest: Vec<u8>,
}

impl LabeledHash {
    /// Hash `data` with SHA-256.
    pub fn sha256(data: &[u8]) -> Self {
        Self {
            scheme: SCHEME_SHA256,
            digest: Sha256::digest(data).to_vec(),
        }
    }

    /// Encode as base58 text (tag byte followed by the digest).
    pub fn to_base58(&self) -> String {
        let mut raw = Vec::with_capacity(1 + self.digest.len());
        raw.push(self.scheme);
        raw.extend_from_slice(&self.digest);
        bs58::encode(raw).into_string()
    }

    /// Decode from base58 text, validating tag and digest length.
    pub fn from_base58(text: &str) -> Result<Self> {
        let raw = bs58::decode(text)
            .into_vec()
            .map_err(|err| Error::InvalidHubId(format!("not base58: {err}")))?;
        let (&scheme, digest) = raw
            .split_first()
            .ok_or_else(|| Error::InvalidHubId("empty hash".into()))?;
        match scheme {
            SCHEME_SHA256 if digest.len() == 32 => Ok(Self {
                scheme,
                digest: digest.to_vec(),
            }),
            SCHEME_SHA256 => Err(Error::InvalidHubId(format!(
                "bad digest length {}",
                digest.len()
            ))),
            other => Err(Error::InvalidHubId(format!("unknown scheme {other}"))),
        }
    }

    /// Whether this hash matches `data`.
    pub fn matches(&self, data: &[u8]) -> bool {
        *self == Self::sha256(data)
    }
}

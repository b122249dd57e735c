//! Glue between the token handler and the partially-blind scheme.
//!
//! The scheme itself is externally defined and lives behind the
//! [`crate::scheme`] seam; this module owns only what the handler layer
//! needs around it: curve identifiers, base58 key encodings, and the
//! serde wire forms of signatures and batch messages.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::scheme::{Info, Message1, Message2, Message3, PublicKey, SecretKey, Signature};
use crate::{Error, Result};

/// Supported curve identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveId {
    /// NIST P-256 (implemented).
    P256,
    /// NIST P-384 (identifier only).
    P384,
    /// NIST P-521 (identifier only).
    P521,
}

impl CurveId {
    /// Parse a curve name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "P-256" => Ok(Self::P256),
            "P-384" => Ok(Self::P384),
            "P-521" => Ok(Self::P521),
            other => Err(Error::UnsupportedCurve(other.to_string())),
        }
    }

    /// Whether the scheme carries arithmetic for the curve.
    pub fn is_implemented(&self) -> bool {
        matches!(self, Self::P256)
    }
}

/// The issuer's secret signing key, configured as base58 text.
pub struct PBlindSecretKey {
    inner: SecretKey,
}

impl PBlindSecretKey {
    /// Generate a fresh signing key.
    pub fn generate() -> Self {
        Self {
            inner: SecretKey::generate(),
        }
    }

    /// Decode from base58.
    pub fn from_base58(text: &str) -> Result<Self> {
        let raw = bs58::decode(text)
            .into_vec()
            .map_err(|err| Error::InvalidKey(format!("not base58: {err}")))?;
        Ok(Self {
            inner: SecretKey::from_bytes(&raw)
                .map_err(|_| Error::InvalidKey("bad secret scalar".into()))?,
        })
    }

    /// Encode as base58.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.inner.to_bytes()).into_string()
    }

    /// The matching public key.
    pub fn public_key(&self) -> PBlindPublicKey {
        PBlindPublicKey {
            inner: self.inner.public_key(),
        }
    }

    pub(crate) fn scheme(&self) -> &SecretKey {
        &self.inner
    }
}

/// The issuer's public key, configured as base58 text.
#[derive(Clone, PartialEq)]
pub struct PBlindPublicKey {
    inner: PublicKey,
}

impl PBlindPublicKey {
    /// Decode from base58.
    pub fn from_base58(text: &str) -> Result<Self> {
        let raw = bs58::decode(text)
            .into_vec()
            .map_err(|err| Error::InvalidKey(format!("not base58: {err}")))?;
        Ok(Self {
            inner: PublicKey::from_bytes(&raw)
                .map_err(|_| Error::InvalidKey("bad public point".into()))?,
        })
    }

    /// Encode as base58.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.inner.to_bytes()).into_string()
    }

    /// Check a signature over `(info, msg)`.
    pub fn check(&self, signature: &PBlindSignature, info: &Info, msg: &[u8]) -> bool {
        self.inner.check(&signature.inner, info, msg)
    }

    pub(crate) fn scheme(&self) -> &PublicKey {
        &self.inner
    }
}

/// An unblinded partially-blind signature in its wire form.
#[derive(Clone, PartialEq)]
pub struct PBlindSignature {
    inner: Signature,
}

impl PBlindSignature {
    /// Serialize to the 128-byte wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes()
    }

    /// Parse from the 128-byte wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: Signature::from_bytes(data)?,
        })
    }
}

impl From<Signature> for PBlindSignature {
    fn from(inner: Signature) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for PBlindSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PBlindSignature({})", hex_prefix(&self.to_bytes()))
    }
}

fn hex_prefix(data: &[u8]) -> String {
    data.iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

macro_rules! impl_serde_bytes {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_bytes(&self.to_bytes())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = <Vec<u8>>::deserialize(deserializer)?;
                Self::from_bytes(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

impl_serde_bytes!(Message1);
impl_serde_bytes!(Message2);
impl_serde_bytes!(Message3);
impl_serde_bytes!(PBlindSignature);

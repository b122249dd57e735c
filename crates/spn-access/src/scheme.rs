//! The partially-blind signature scheme (Abe–Okamoto).
//!
//! The scheme is externally defined; the token handler owns only
//! batching, serialization, and verification glue and talks to the
//! scheme exclusively through the surface of this module: opaque keys,
//! an [`Info`] point compressed from the public metadata, the three
//! protocol messages, and the signer/requester states. No published
//! crate implements this scheme, so it is carried here as a
//! self-contained module; swapping in an external implementation later
//! only touches this file. Nothing outside it handles curve arithmetic.
//!
//! Three messages issue one signature:
//!
//! 1. Signer → Requester: commitments `A = uG`, `B = sG + dZ`
//! 2. Requester → Signer: the blinded challenge `e = ε − t2 − t4` with
//!    `ε = H(α, β, Z, Y, m)`, `α = A + t1·G + t2·Y`, `β = B + t3·G + t4·Z`
//! 3. Signer → Requester: `(r, c, s, d)` with `c = e − d`, `r = u − c·x`
//!
//! The requester unblinds to `(ρ, ω, σ, δ)`. A signature verifies iff
//! `ω + δ = H(ρG + ωY, σG + δZ, Z, Y, m)`. The signer learns nothing
//! linking a signature to its issuance beyond the public info point `Z`.
//!
//! `Z` is derived from the public info by try-and-increment hashing, so
//! its discrete log is unknown to everyone.

use p256::elliptic_curve::point::DecompressPoint;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::elliptic_curve::subtle::Choice;
use p256::elliptic_curve::{Field, PrimeField};
use p256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Size of a compressed P-256 point on the wire.
const POINT_SIZE: usize = 33;
/// Size of a P-256 scalar on the wire.
const SCALAR_SIZE: usize = 32;

// === Codec helpers ===

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

fn decode_point(data: &[u8]) -> Result<ProjectivePoint> {
    let encoded = EncodedPoint::from_bytes(data)
        .map_err(|_| Error::TokenMalformed("bad point encoding".into()))?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
        .ok_or_else(|| Error::TokenMalformed("point not on curve".into()))
}

fn encode_scalar(scalar: &Scalar) -> [u8; SCALAR_SIZE] {
    scalar.to_repr().into()
}

fn decode_scalar(data: &[u8]) -> Result<Scalar> {
    if data.len() != SCALAR_SIZE {
        return Err(Error::TokenMalformed("bad scalar length".into()));
    }
    Option::<Scalar>::from(Scalar::from_repr(*FieldBytes::from_slice(data)))
        .ok_or_else(|| Error::TokenMalformed("scalar out of range".into()))
}

/// Hash arbitrary input parts to a uniformly distributed scalar.
fn hash_to_scalar(parts: &[&[u8]]) -> Scalar {
    let mut counter = 0u32;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(b"spn-pblind-scalar");
        for part in parts {
            hasher.update(part);
        }
        hasher.update(counter.to_be_bytes());
        let digest = hasher.finalize();
        if let Some(scalar) = Option::<Scalar>::from(Scalar::from_repr(digest)) {
            return scalar;
        }
        counter += 1;
    }
}

/// The public info compressed to a curve point with unknown discrete log.
#[derive(Clone, Copy, PartialEq)]
pub struct Info(ProjectivePoint);

/// Compress public info bytes to an [`Info`] point.
pub fn compress_info(info: &[u8]) -> Info {
    let mut counter = 0u32;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(b"spn-pblind-info");
        hasher.update(info);
        hasher.update(counter.to_be_bytes());
        let digest = hasher.finalize();
        let maybe = AffinePoint::decompress(&digest, Choice::from(0));
        if let Some(point) = Option::<AffinePoint>::from(maybe) {
            return Info(ProjectivePoint::from(point));
        }
        counter += 1;
    }
}

fn challenge(
    alpha: &ProjectivePoint,
    beta: &ProjectivePoint,
    info: &Info,
    public: &ProjectivePoint,
    msg: &[u8],
) -> Scalar {
    hash_to_scalar(&[
        &encode_point(alpha),
        &encode_point(beta),
        &encode_point(&info.0),
        &encode_point(public),
        msg,
    ])
}

// === Keys ===

/// The signer's secret key.
pub struct SecretKey {
    x: Scalar,
}

impl SecretKey {
    /// Generate a fresh signing key.
    pub fn generate() -> Self {
        Self {
            x: Scalar::random(&mut rand::rngs::OsRng),
        }
    }

    /// Parse from the 32-byte wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            x: decode_scalar(data)?,
        })
    }

    /// Serialize to the 32-byte wire form.
    pub fn to_bytes(&self) -> [u8; SCALAR_SIZE] {
        encode_scalar(&self.x)
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            y: ProjectivePoint::GENERATOR * self.x,
        }
    }
}

/// The signer's public key.
#[derive(Clone, PartialEq)]
pub struct PublicKey {
    y: ProjectivePoint,
}

impl PublicKey {
    /// Parse from the compressed-point wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            y: decode_point(data)?,
        })
    }

    /// Serialize to the compressed-point wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_point(&self.y)
    }

    /// Check a signature over `(info, msg)`.
    pub fn check(&self, signature: &Signature, info: &Info, msg: &[u8]) -> bool {
        let generator = ProjectivePoint::GENERATOR;
        let alpha = generator * signature.rho + self.y * signature.omega;
        let beta = generator * signature.sigma + info.0 * signature.delta;
        let eps = challenge(&alpha, &beta, info, &self.y, msg);
        signature.omega + signature.delta == eps
    }
}

// === Wire messages ===

/// Signer commitments (message 1).
#[derive(Clone)]
pub struct Message1 {
    a: ProjectivePoint,
    b: ProjectivePoint,
}

impl Message1 {
    /// Serialize to the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = encode_point(&self.a);
        out.extend_from_slice(&encode_point(&self.b));
        out
    }

    /// Parse from the wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != 2 * POINT_SIZE {
            return Err(Error::TokenMalformed("bad message1 length".into()));
        }
        Ok(Self {
            a: decode_point(&data[..POINT_SIZE])?,
            b: decode_point(&data[POINT_SIZE..])?,
        })
    }
}

/// The blinded challenge (message 2).
#[derive(Clone)]
pub struct Message2 {
    e: Scalar,
}

impl Message2 {
    /// Serialize to the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_scalar(&self.e).to_vec()
    }

    /// Parse from the wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self {
            e: decode_scalar(data)?,
        })
    }
}

/// The blinded signature parts (message 3).
#[derive(Clone)]
pub struct Message3 {
    r: Scalar,
    c: Scalar,
    s: Scalar,
    d: Scalar,
}

impl Message3 {
    /// Serialize to the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * SCALAR_SIZE);
        for scalar in [&self.r, &self.c, &self.s, &self.d] {
            out.extend_from_slice(&encode_scalar(scalar));
        }
        out
    }

    /// Parse from the wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != 4 * SCALAR_SIZE {
            return Err(Error::TokenMalformed("bad message3 length".into()));
        }
        Ok(Self {
            r: decode_scalar(&data[..32])?,
            c: decode_scalar(&data[32..64])?,
            s: decode_scalar(&data[64..96])?,
            d: decode_scalar(&data[96..])?,
        })
    }
}

/// An unblinded partially-blind signature.
#[derive(Clone, PartialEq)]
pub struct Signature {
    rho: Scalar,
    omega: Scalar,
    sigma: Scalar,
    delta: Scalar,
}

impl Signature {
    /// Serialize to the 128-byte wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 * SCALAR_SIZE);
        for scalar in [&self.rho, &self.omega, &self.sigma, &self.delta] {
            out.extend_from_slice(&encode_scalar(scalar));
        }
        out
    }

    /// Parse from the 128-byte wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != 4 * SCALAR_SIZE {
            return Err(Error::TokenMalformed("bad signature length".into()));
        }
        Ok(Self {
            rho: decode_scalar(&data[..32])?,
            omega: decode_scalar(&data[32..64])?,
            sigma: decode_scalar(&data[64..96])?,
            delta: decode_scalar(&data[96..])?,
        })
    }
}

// === Protocol states ===

/// Signer-side state for one token of a batch.
pub struct StateSigner {
    x: Scalar,
    info: Info,
    u: Scalar,
    s: Scalar,
    d: Scalar,
    e: Option<Scalar>,
}

impl StateSigner {
    /// Create signer state bound to the secret key and info point.
    pub fn new(secret: &SecretKey, info: Info) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            x: secret.x,
            info,
            u: Scalar::random(&mut rng),
            s: Scalar::random(&mut rng),
            d: Scalar::random(&mut rng),
            e: None,
        }
    }

    /// Produce the commitment message.
    pub fn message1(&self) -> Message1 {
        let generator = ProjectivePoint::GENERATOR;
        Message1 {
            a: generator * self.u,
            b: generator * self.s + self.info.0 * self.d,
        }
    }

    /// Take in the requester's blinded challenge.
    pub fn process_message2(&mut self, msg: &Message2) {
        self.e = Some(msg.e);
    }

    /// Produce the blinded signature parts.
    pub fn message3(&self) -> Result<Message3> {
        let e = self
            .e
            .ok_or_else(|| Error::ProtocolState("message2 not processed".into()))?;
        let c = e - self.d;
        Ok(Message3 {
            r: self.u - c * self.x,
            c,
            s: self.s,
            d: self.d,
        })
    }
}

/// Requester-side state for one token of a batch.
pub struct StateRequester {
    public: ProjectivePoint,
    info: Info,
    msg: Vec<u8>,
    t1: Scalar,
    t2: Scalar,
    t3: Scalar,
    t4: Scalar,
    blinded: bool,
}

impl StateRequester {
    /// Create requester state bound to `(public key, info, message)`.
    pub fn new(public: &PublicKey, info: Info, msg: &[u8]) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            public: public.y,
            info,
            msg: msg.to_vec(),
            t1: Scalar::random(&mut rng),
            t2: Scalar::random(&mut rng),
            t3: Scalar::random(&mut rng),
            t4: Scalar::random(&mut rng),
            blinded: false,
        }
    }

    /// Blind the signer's commitments into the challenge message.
    pub fn process_message1(&mut self, msg: &Message1) -> Message2 {
        let generator = ProjectivePoint::GENERATOR;
        let alpha = msg.a + generator * self.t1 + self.public * self.t2;
        let beta = msg.b + generator * self.t3 + self.info.0 * self.t4;
        let eps = challenge(&alpha, &beta, &self.info, &self.public, &self.msg);
        self.blinded = true;
        Message2 {
            e: eps - self.t2 - self.t4,
        }
    }

    /// Unblind the signature parts into the final signature.
    pub fn process_message3(&self, msg: &Message3) -> Result<Signature> {
        if !self.blinded {
            return Err(Error::ProtocolState("message1 not processed".into()));
        }
        Ok(Signature {
            rho: msg.r + self.t1,
            omega: msg.c + self.t2,
            sigma: msg.s + self.t3,
            delta: msg.d + self.t4,
        })
    }
}

//! Hub documents: announcements, statuses, and their signed wire form.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::lhash::LabeledHash;
use crate::transport::Transport;
use crate::{Error, Result};

/// Seconds since the Unix epoch.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A hub as known to the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hub {
    /// Base58 labeled hash of the hub's identity key.
    pub id: String,
    /// The administrative map this hub belongs to.
    pub map: String,
    /// The hub's announcement.
    pub info: Announcement,
    /// The hub's current status.
    pub status: Status,
}

impl Hub {
    /// Select the hub's current exchange key, skipping expired entries.
    pub fn select_signet(&self) -> Option<&SignetEntry> {
        let now = now_unix();
        self.status.keys.iter().find(|entry| entry.expires > now)
    }
}

/// Static connection information, signed by the hub identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// The hub's own ID.
    pub id: String,
    /// Reachable transport addresses.
    pub transports: Vec<String>,
    /// IPv4 address, if any.
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address, if any.
    pub ipv6: Option<Ipv6Addr>,
    /// Export time, seconds since the Unix epoch.
    pub timestamp: u64,
}

/// Rotating state, signed by the hub identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Export time, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Published exchange keys, newest first.
    pub keys: Vec<SignetEntry>,
}

/// One published exchange key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignetEntry {
    /// Key ID, referenced by encrypted-channel letters.
    pub id: String,
    /// Key scheme; currently always `x25519`.
    pub scheme: String,
    /// The public key.
    pub key: [u8; 32],
    /// Expiry, seconds since the Unix epoch.
    pub expires: u64,
}

/// 64-byte signature wrapper for serde byte encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBytes(pub [u8; 64]);

impl Serialize for SignatureBytes {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = <Vec<u8>>::deserialize(deserializer)?;
        if raw.len() != 64 {
            return Err(serde::de::Error::invalid_length(
                raw.len(),
                &"exactly 64 bytes",
            ));
        }
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

/// The signed wire form of an announcement or status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedBlock {
    /// CBOR-encoded document body.
    pub body: Vec<u8>,
    /// The signing identity key.
    pub key: [u8; 32],
    /// Ed25519 signature over the body.
    pub signature: SignatureBytes,
}

impl SignedBlock {
    /// Encode this block as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out)
            .map_err(|err| Error::Serialization(err.to_string()))?;
        Ok(out)
    }

    /// Decode a block from CBOR and check its signature.
    pub fn verify(data: &[u8], what: &'static str) -> Result<Self> {
        let block: SignedBlock = ciborium::de::from_reader(data)
            .map_err(|err| Error::MalformedDocument(format!("{what}: {err}")))?;
        let key = VerifyingKey::from_bytes(&block.key)
            .map_err(|_| Error::MalformedDocument(format!("{what}: bad identity key")))?;
        let signature = Signature::from_bytes(&block.signature.0);
        key.verify(&block.body, &signature)
            .map_err(|_| Error::InvalidSignature(what))?;
        Ok(block)
    }
}

/// Parse and verify a hub's announcement and status blocks.
///
/// Both blocks must be signed by the same identity key; the hub ID is the
/// labeled hash of that key and, when `expected_id` is given, must match
/// it. The announcement must agree on the ID.
pub fn import_and_verify_hub_info(
    expected_id: Option<&str>,
    announcement_data: &[u8],
    status_data: &[u8],
    map: &str,
) -> Result<Hub> {
    let announcement_block = SignedBlock::verify(announcement_data, "announcement")?;
    let status_block = SignedBlock::verify(status_data, "status")?;

    if announcement_block.key != status_block.key {
        return Err(Error::IdentityMismatch(
            "announcement and status signed by different keys".into(),
        ));
    }

    let id = LabeledHash::sha256(&announcement_block.key).to_base58();
    if let Some(expected) = expected_id {
        if expected != id {
            return Err(Error::IdentityMismatch(format!(
                "expected hub {expected}, got {id}"
            )));
        }
    }

    let info: Announcement = ciborium::de::from_reader(announcement_block.body.as_slice())
        .map_err(|err| Error::MalformedDocument(format!("announcement body: {err}")))?;
    if info.id != id {
        return Err(Error::IdentityMismatch(
            "announcement carries a foreign hub ID".into(),
        ));
    }
    let status: Status = ciborium::de::from_reader(status_block.body.as_slice())
        .map_err(|err| Error::MalformedDocument(format!("status body: {err}")))?;

    Ok(Hub {
        id,
        map: map.to_string(),
        info,
        status,
    })
}

/// Parse a bootstrap hub entry: `<transport>://<ip>:<port>/#<base58-hub-ID>`.
///
/// The hub ID rides in the URL fragment; the IP is lifted into the
/// announcement and both host and fragment are stripped from the stored
/// transport.
pub fn parse_bootstrap_hub(bootstrap_transport: &str, map: &str) -> Result<Hub> {
    let mut transport = Transport::parse(bootstrap_transport)?;
    if transport.option.is_empty() {
        return Err(Error::InvalidHubId("missing hub ID in URL fragment".into()));
    }
    LabeledHash::from_base58(&transport.option)?;

    let ip: IpAddr = transport.bare_host().parse().map_err(|_| {
        Error::InvalidTransport(
            "invalid IP address (domains are not supported for bootstrapping)".into(),
        )
    })?;

    let id = std::mem::take(&mut transport.option);
    transport.domain = String::new();

    let mut info = Announcement {
        id: id.clone(),
        transports: vec![transport.to_string()],
        ipv4: None,
        ipv6: None,
        timestamp: 0,
    };
    match ip {
        IpAddr::V4(ip) => info.ipv4 = Some(ip),
        IpAddr::V6(ip) => info.ipv6 = Some(ip),
    }

    Ok(Hub {
        id,
        map: map.to_string(),
        info,
        status: Status::default(),
    })
}

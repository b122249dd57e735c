//! The local hub identity: signing key plus rotating exchange keys.

use std::sync::{Arc, Mutex};

use ed25519_dalek::{Signer, SigningKey};
use spn_crypto::ExchangeKeyPair;

use crate::hub::{now_unix, Announcement, Hub, SignatureBytes, SignedBlock, SignetEntry, Status};
use crate::lhash::LabeledHash;
use crate::{Error, Result};

/// Lifetime of a published exchange key.
const EXCHANGE_KEY_LIFETIME_SECS: u64 = 48 * 60 * 60;

struct ExchangeKey {
    id: String,
    pair: Arc<ExchangeKeyPair>,
    expires: u64,
}

/// The local hub's long-term identity.
pub struct Identity {
    signing: SigningKey,
    id: String,
    map: String,
    transports: Vec<String>,
    exchange_keys: Mutex<Vec<ExchangeKey>>,
}

impl Identity {
    /// Create a fresh identity with one exchange key.
    pub fn create(map: &str) -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let id = LabeledHash::sha256(signing.verifying_key().as_bytes()).to_base58();
        let identity = Self {
            signing,
            id,
            map: map.to_string(),
            transports: Vec::new(),
            exchange_keys: Mutex::new(Vec::new()),
        };
        identity.rotate_exchange_key();
        identity
    }

    /// The hub ID derived from the identity key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Publish a new exchange key; older keys stay valid until expiry.
    pub fn rotate_exchange_key(&self) {
        let pair = Arc::new(ExchangeKeyPair::generate());
        let key = ExchangeKey {
            id: bs58::encode(&pair.public_key()[..8]).into_string(),
            pair,
            expires: now_unix() + EXCHANGE_KEY_LIFETIME_SECS,
        };
        let mut keys = self.exchange_keys.lock().unwrap_or_else(|p| p.into_inner());
        keys.insert(0, key);
        keys.retain(|key| key.expires > now_unix());
    }

    /// Look up the exchange key pair referenced by a letter.
    pub fn exchange_pair(&self, key_id: &str) -> Result<Arc<ExchangeKeyPair>> {
        self.exchange_keys
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|key| key.id == key_id)
            .map(|key| key.pair.clone())
            .ok_or_else(|| Error::NoExchangeKey(format!("no exchange key {key_id}")))
    }

    /// The hub view of this identity, for the local map.
    pub fn hub(&self) -> Hub {
        Hub {
            id: self.id.clone(),
            map: self.map.clone(),
            info: self.announcement(),
            status: self.status(),
        }
    }

    fn announcement(&self) -> Announcement {
        Announcement {
            id: self.id.clone(),
            transports: self.transports.clone(),
            ipv4: None,
            ipv6: None,
            timestamp: now_unix(),
        }
    }

    fn status(&self) -> Status {
        let keys = self.exchange_keys.lock().unwrap_or_else(|p| p.into_inner());
        Status {
            timestamp: now_unix(),
            keys: keys
                .iter()
                .map(|key| SignetEntry {
                    id: key.id.clone(),
                    scheme: "x25519".into(),
                    key: *key.pair.public_key(),
                    expires: key.expires,
                })
                .collect(),
        }
    }

    /// Export the signed announcement block.
    pub fn export_announcement(&self) -> Result<Vec<u8>> {
        self.export(&self.announcement())
    }

    /// Export the signed status block.
    pub fn export_status(&self) -> Result<Vec<u8>> {
        self.export(&self.status())
    }

    /// Sign an arbitrary challenge nonce with the identity key.
    pub fn sign_challenge(&self, challenge: &[u8]) -> ([u8; 32], [u8; 64]) {
        let signature = self.signing.sign(challenge);
        (
            self.signing.verifying_key().to_bytes(),
            signature.to_bytes(),
        )
    }

    fn export<T: serde::Serialize>(&self, document: &T) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(document, &mut body)
            .map_err(|err| Error::Serialization(err.to_string()))?;
        let signature = self.signing.sign(&body);
        SignedBlock {
            body,
            key: self.signing.verifying_key().to_bytes(),
            signature: SignatureBytes(signature.to_bytes()),
        }
        .to_bytes()
    }
}

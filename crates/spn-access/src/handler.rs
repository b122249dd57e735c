//! The batched token handler: issuance pipeline, storage, persistence.

use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use spn_core::Container;

use crate::pblind::{CurveId, PBlindPublicKey, PBlindSecretKey, PBlindSignature};
use crate::scheme::{compress_info, Info, Message1, Message2, Message3, StateRequester, StateSigner};
use crate::{Error, Result};

/// Size of the secret token nonce.
const TOKEN_NONCE_SIZE: usize = 32;

/// Serialization format tag preceding CBOR payloads on disk.
const FORMAT_TAG_CBOR: u8 = b'C';

/// An opaque token as handed to the access layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The zone this token belongs to.
    pub zone: String,
    /// The packed token data.
    pub data: Vec<u8>,
}

/// The 32-byte token nonce, serialized as bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenNonce(pub [u8; TOKEN_NONCE_SIZE]);

impl Serialize for TokenNonce {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for TokenNonce {
    fn deserialize<D>(deserializer: D) -> core::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = <Vec<u8>>::deserialize(deserializer)?;
        let bytes: [u8; TOKEN_NONCE_SIZE] = raw
            .try_into()
            .map_err(|_| serde::de::Error::custom("token nonce must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// A finalized partially-blind token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PBlindToken {
    /// Batch serial; 0 when serials are disabled.
    #[serde(rename = "N", default)]
    pub serial: u64,
    /// The secret random nonce.
    #[serde(rename = "T")]
    pub token: TokenNonce,
    /// Signature over (info, nonce).
    #[serde(rename = "S")]
    pub signature: PBlindSignature,
}

impl PBlindToken {
    /// Pack as format-tagged CBOR.
    pub fn pack(&self) -> Result<Vec<u8>> {
        pack_cbor(self)
    }

    /// Unpack from format-tagged CBOR.
    pub fn unpack(data: &[u8]) -> Result<Self> {
        unpack_cbor(data)
    }
}

fn pack_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = vec![FORMAT_TAG_CBOR];
    ciborium::ser::into_writer(value, &mut out)
        .map_err(|err| Error::Serialization(err.to_string()))?;
    Ok(out)
}

fn unpack_cbor<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    match data.split_first() {
        Some((&FORMAT_TAG_CBOR, body)) => ciborium::de::from_reader(body)
            .map_err(|err| Error::TokenMalformed(err.to_string())),
        Some((other, _)) => Err(Error::TokenMalformed(format!(
            "unknown format tag {other:#04x}"
        ))),
        None => Err(Error::TokenMalformed("empty data".into())),
    }
}

/// Construction options for a [`PBlindHandler`].
#[derive(Clone, Default)]
pub struct PBlindOptions {
    /// Token namespace.
    pub zone: String,
    /// Curve name; currently `P-256`.
    pub curve_name: String,
    /// Issuer public key, base58. Derived from the private key if empty.
    pub public_key: String,
    /// Issuer private key, base58; only set on the signer.
    pub private_key: String,
    /// Bind batch serials into the signed info.
    pub use_serials: bool,
    /// Tokens per issuance batch.
    pub batch_size: usize,
    /// Shuffle finalized batches before they join storage.
    pub randomize_order: bool,
    /// Called when storage runs low and tokens should be requested.
    pub signal_should_request: Option<Arc<dyn Fn(&PBlindHandler) + Send + Sync>>,
    /// Double-spend check; an error marks the token as used.
    pub double_spend_protection:
        Option<Arc<dyn Fn(&[u8]) -> core::result::Result<(), String> + Send + Sync>>,
}

/// Signer-side state for one in-flight batch.
pub struct PBlindSignerState {
    signers: Vec<StateSigner>,
}

/// Batch setup messages (signer → requester).
#[derive(Serialize, Deserialize)]
pub struct PBlindSetupResponse {
    /// One setup message per serial.
    pub msgs: Vec<Option<Message1>>,
}

/// Batch token request (requester → signer).
#[derive(Serialize, Deserialize)]
pub struct PBlindTokenRequest {
    /// One blinded challenge per serial.
    pub msgs: Vec<Option<Message2>>,
}

/// Batch of issued tokens (signer → requester).
#[derive(Serialize, Deserialize)]
pub struct IssuedPBlindTokens {
    /// One blinded signature per serial.
    pub msgs: Vec<Option<Message3>>,
}

struct RequestState {
    token: [u8; TOKEN_NONCE_SIZE],
    state: StateRequester,
}

/// Handler for one zone's partially-blind tokens.
pub struct PBlindHandler {
    opts: PBlindOptions,
    public_key: PBlindPublicKey,
    private_key: Option<PBlindSecretKey>,
    storage: Mutex<Vec<PBlindToken>>,
    request_state: Mutex<Vec<RequestState>>,
}

impl PBlindHandler {
    /// Create a handler from options.
    ///
    /// Requires a key: the private key on the issuer, at least the public
    /// key everywhere else.
    pub fn new(opts: PBlindOptions) -> Result<Self> {
        let curve = CurveId::from_name(&opts.curve_name)?;
        if !curve.is_implemented() {
            return Err(Error::UnsupportedCurve(opts.curve_name.clone()));
        }

        let (private_key, public_key) = if !opts.private_key.is_empty() {
            let private = PBlindSecretKey::from_base58(&opts.private_key)?;
            let public = private.public_key();
            if !opts.public_key.is_empty() && opts.public_key != public.to_base58() {
                return Err(Error::InvalidKey("private and public key mismatch".into()));
            }
            (Some(private), public)
        } else if !opts.public_key.is_empty() {
            (None, PBlindPublicKey::from_base58(&opts.public_key)?)
        } else {
            return Err(Error::InvalidKey("no key supplied".into()));
        };

        Ok(Self {
            opts,
            public_key,
            private_key,
            storage: Mutex::new(Vec::new()),
            request_state: Mutex::new(Vec::new()),
        })
    }

    /// The zone name.
    pub fn zone(&self) -> &str {
        &self.opts.zone
    }

    /// The current amount of stored tokens.
    pub fn amount(&self) -> usize {
        self.lock_storage().len()
    }

    /// Whether new tokens should be requested.
    pub fn should_request(&self) -> bool {
        Self::storage_is_low(&self.lock_storage(), self.opts.batch_size)
    }

    // Storage at or below 10% triggers a restock.
    fn storage_is_low(storage: &[PBlindToken], batch_size: usize) -> bool {
        storage.is_empty() || batch_size / storage.len() > 10
    }

    fn make_info(&self, serial: u64) -> Info {
        let mut info = Container::new();
        info.append_as_block(self.opts.zone.as_bytes());
        if self.opts.use_serials {
            info.append_number(serial);
        }
        compress_info(info.as_slice())
    }

    /// Signer: set up a batch, producing state and setup messages.
    pub fn create_setup(&self) -> Result<(PBlindSignerState, PBlindSetupResponse)> {
        let private_key = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::InvalidKey("signing requires the private key".into()))?;

        let mut signers = Vec::with_capacity(self.opts.batch_size);
        let mut msgs = Vec::with_capacity(self.opts.batch_size);
        for i in 0..self.opts.batch_size {
            let info = self.make_info(i as u64 + 1);
            let signer = StateSigner::new(private_key.scheme(), info);
            msgs.push(Some(signer.message1()));
            signers.push(signer);
        }

        Ok((PBlindSignerState { signers }, PBlindSetupResponse { msgs }))
    }

    /// Requester: turn setup messages into a token request.
    ///
    /// Resets any previous in-flight request state.
    pub fn create_token_request(
        &self,
        setup: &PBlindSetupResponse,
    ) -> Result<PBlindTokenRequest> {
        if setup.msgs.len() != self.opts.batch_size {
            return Err(Error::BatchMismatch(format!(
                "got {} setup msgs, expected {}",
                setup.msgs.len(),
                self.opts.batch_size
            )));
        }

        let mut request_state = self.lock_request_state();
        request_state.clear();
        let mut msgs = Vec::with_capacity(self.opts.batch_size);

        for (i, setup_msg) in setup.msgs.iter().enumerate() {
            let setup_msg = setup_msg.as_ref().ok_or(Error::MissingSlot(i))?;

            let mut token = [0u8; TOKEN_NONCE_SIZE];
            rand::rngs::OsRng.fill_bytes(&mut token);

            let info = self.make_info(i as u64 + 1);
            let mut state = StateRequester::new(self.public_key.scheme(), info, &token);
            msgs.push(Some(state.process_message1(setup_msg)));
            request_state.push(RequestState { token, state });
        }

        Ok(PBlindTokenRequest { msgs })
    }

    /// Signer: sign the requested tokens.
    pub fn issue_tokens(
        &self,
        state: &mut PBlindSignerState,
        request: &PBlindTokenRequest,
    ) -> Result<IssuedPBlindTokens> {
        if request.msgs.len() != self.opts.batch_size {
            return Err(Error::BatchMismatch(format!(
                "got {} request msgs, expected {}",
                request.msgs.len(),
                self.opts.batch_size
            )));
        }
        if state.signers.len() != self.opts.batch_size {
            return Err(Error::BatchMismatch(format!(
                "got {} signer states, expected {}",
                state.signers.len(),
                self.opts.batch_size
            )));
        }

        let mut msgs = Vec::with_capacity(self.opts.batch_size);
        for (i, (signer, request_msg)) in
            state.signers.iter_mut().zip(&request.msgs).enumerate()
        {
            let request_msg = request_msg.as_ref().ok_or(Error::MissingSlot(i))?;
            signer.process_message2(request_msg);
            msgs.push(Some(signer.message3()?));
        }

        Ok(IssuedPBlindTokens { msgs })
    }

    /// Requester: finalize issued tokens into storage.
    ///
    /// The whole batch is rejected if any single signature fails its
    /// local check; tokens from a faulty batch could be attacker-chosen.
    pub fn process_issued_tokens(&self, issued: &IssuedPBlindTokens) -> Result<()> {
        if issued.msgs.len() != self.opts.batch_size {
            return Err(Error::BatchMismatch(format!(
                "got {} issued msgs, expected {}",
                issued.msgs.len(),
                self.opts.batch_size
            )));
        }

        let mut request_state = self.lock_request_state();
        if request_state.len() != self.opts.batch_size {
            return Err(Error::ProtocolState("no request in flight".into()));
        }

        let mut finalized = Vec::with_capacity(self.opts.batch_size);
        let result = (|| {
            for (i, (request, issued_msg)) in
                request_state.iter().zip(&issued.msgs).enumerate()
            {
                let issued_msg = issued_msg.as_ref().ok_or(Error::MissingSlot(i))?;
                let signature: PBlindSignature =
                    request.state.process_message3(issued_msg)?.into();

                let info = self.make_info(i as u64 + 1);
                if !self.public_key.check(&signature, &info, &request.token) {
                    return Err(Error::TokenInvalid);
                }

                finalized.push(PBlindToken {
                    serial: if self.opts.use_serials { i as u64 + 1 } else { 0 },
                    token: TokenNonce(request.token),
                    signature,
                });
            }
            Ok(())
        })();
        request_state.clear();
        result?;

        // Break any positional correlation the server could try to keep.
        if self.opts.randomize_order {
            finalized.shuffle(&mut rand::rngs::OsRng);
        }

        self.lock_storage().extend(finalized);
        Ok(())
    }

    /// Pop the next token for spending.
    pub fn get_token(&self) -> Result<Token> {
        let (token, low) = {
            let mut storage = self.lock_storage();
            if storage.is_empty() {
                return Err(Error::Empty);
            }
            let token = storage.remove(0);
            let low = Self::storage_is_low(&storage, self.opts.batch_size);
            (token, low)
        };

        let data = token.pack()?;
        if low {
            if let Some(signal) = &self.opts.signal_should_request {
                signal(self);
            }
        }

        Ok(Token {
            zone: self.opts.zone.clone(),
            data,
        })
    }

    /// Verify a presented token.
    pub fn verify(&self, token: &Token) -> Result<()> {
        if token.zone != self.opts.zone {
            return Err(Error::ZoneMismatch);
        }

        let unpacked = PBlindToken::unpack(&token.data)?;

        let serial_ok = if self.opts.use_serials {
            unpacked.serial >= 1 && unpacked.serial <= self.opts.batch_size as u64
        } else {
            unpacked.serial == 0
        };
        if !serial_ok {
            return Err(Error::TokenMalformed("invalid serial".into()));
        }

        let info = self.make_info(unpacked.serial);
        if !self
            .public_key
            .check(&unpacked.signature, &info, &unpacked.token.0)
        {
            return Err(Error::TokenInvalid);
        }

        if let Some(double_spend) = &self.opts.double_spend_protection {
            double_spend(&unpacked.token.0).map_err(Error::TokenUsed)?;
        }

        Ok(())
    }

    /// Serialize the current storage.
    pub fn save(&self) -> Result<Vec<u8>> {
        let storage = self.lock_storage();
        if storage.is_empty() {
            return Err(Error::Empty);
        }
        pack_cbor(&PBlindStorage {
            storage: storage.clone(),
        })
    }

    /// Load previously saved tokens, re-verifying every signature.
    ///
    /// A blob with any invalid token is rejected as a whole; the
    /// in-memory storage stays untouched.
    pub fn load(&self, data: &[u8]) -> Result<()> {
        let loaded: PBlindStorage = unpack_cbor(data)?;

        for token in &loaded.storage {
            let info = self.make_info(token.serial);
            if !self
                .public_key
                .check(&token.signature, &info, &token.token.0)
            {
                return Err(Error::TokenInvalid);
            }
        }

        *self.lock_storage() = loaded.storage;
        Ok(())
    }

    /// Drop all stored tokens.
    pub fn clear(&self) {
        self.lock_storage().clear();
    }

    fn lock_storage(&self) -> std::sync::MutexGuard<'_, Vec<PBlindToken>> {
        self.storage.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_request_state(&self) -> std::sync::MutexGuard<'_, Vec<RequestState>> {
        self.request_state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// On-disk form of the token storage.
#[derive(Serialize, Deserialize)]
struct PBlindStorage {
    /// The stored tokens in spending order.
    #[serde(rename = "Storage")]
    storage: Vec<PBlindToken>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BATCH_SIZE: usize = 16;

    fn issuer_and_client() -> (PBlindHandler, PBlindHandler) {
        let secret = PBlindSecretKey::generate();
        let issuer = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-256".into(),
            private_key: secret.to_base58(),
            use_serials: true,
            batch_size: BATCH_SIZE,
            ..PBlindOptions::default()
        })
        .unwrap();
        let client = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-256".into(),
            public_key: secret.public_key().to_base58(),
            use_serials: true,
            batch_size: BATCH_SIZE,
            ..PBlindOptions::default()
        })
        .unwrap();
        (issuer, client)
    }

    fn run_batch(issuer: &PBlindHandler, client: &PBlindHandler) {
        let (mut state, setup) = issuer.create_setup().unwrap();
        let request = client.create_token_request(&setup).unwrap();
        let issued = issuer.issue_tokens(&mut state, &request).unwrap();
        client.process_issued_tokens(&issued).unwrap();
    }

    #[test]
    fn full_batch_issues_verifiable_tokens() {
        let (issuer, client) = issuer_and_client();
        run_batch(&issuer, &client);
        assert_eq!(client.amount(), BATCH_SIZE);

        for _ in 0..BATCH_SIZE {
            let token = client.get_token().unwrap();
            assert_eq!(token.zone, "test");
            issuer.verify(&token).unwrap();
        }
        assert!(matches!(client.get_token(), Err(Error::Empty)));
    }

    #[test]
    fn tampered_tokens_fail_verification() {
        let (issuer, client) = issuer_and_client();
        run_batch(&issuer, &client);
        let token = client.get_token().unwrap();

        // Tamper the nonce.
        let mut unpacked = PBlindToken::unpack(&token.data).unwrap();
        unpacked.token.0[0] ^= 0x01;
        let tampered = Token {
            zone: "test".into(),
            data: unpacked.pack().unwrap(),
        };
        assert!(matches!(issuer.verify(&tampered), Err(Error::TokenInvalid)));

        // Tamper the signature.
        let mut unpacked = PBlindToken::unpack(&token.data).unwrap();
        let mut sig = unpacked.signature.to_bytes();
        sig[17] ^= 0x01;
        if let Ok(bad) = PBlindSignature::from_bytes(&sig) {
            unpacked.signature = bad;
            let tampered = Token {
                zone: "test".into(),
                data: unpacked.pack().unwrap(),
            };
            assert!(matches!(issuer.verify(&tampered), Err(Error::TokenInvalid)));
        }

        // The untampered token still passes.
        issuer.verify(&token).unwrap();
    }

    #[test]
    fn zone_and_serial_are_enforced() {
        let (issuer, client) = issuer_and_client();
        run_batch(&issuer, &client);
        let token = client.get_token().unwrap();

        let wrong_zone = Token {
            zone: "other".into(),
            data: token.data.clone(),
        };
        assert!(matches!(issuer.verify(&wrong_zone), Err(Error::ZoneMismatch)));

        let mut unpacked = PBlindToken::unpack(&token.data).unwrap();
        unpacked.serial = BATCH_SIZE as u64 + 1;
        let bad_serial = Token {
            zone: "test".into(),
            data: unpacked.pack().unwrap(),
        };
        assert!(matches!(
            issuer.verify(&bad_serial),
            Err(Error::TokenMalformed(_))
        ));
    }

    #[test]
    fn double_spend_hook_is_fatal() {
        let secret = PBlindSecretKey::generate();
        let spent = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let spent2 = spent.clone();

        let issuer = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-256".into(),
            private_key: secret.to_base58(),
            use_serials: true,
            batch_size: BATCH_SIZE,
            double_spend_protection: Some(Arc::new(move |nonce| {
                let mut spent = spent2.lock().unwrap();
                if spent.iter().any(|seen| seen == nonce) {
                    return Err("nonce already seen".into());
                }
                spent.push(nonce.to_vec());
                Ok(())
            })),
            ..PBlindOptions::default()
        })
        .unwrap();
        let client = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-256".into(),
            public_key: secret.public_key().to_base58(),
            use_serials: true,
            batch_size: BATCH_SIZE,
            ..PBlindOptions::default()
        })
        .unwrap();

        run_batch(&issuer, &client);
        let token = client.get_token().unwrap();
        issuer.verify(&token).unwrap();
        assert!(matches!(issuer.verify(&token), Err(Error::TokenUsed(_))));
    }

    #[test]
    fn save_and_load_round_trip() {
        let (issuer, client) = issuer_and_client();
        run_batch(&issuer, &client);

        let blob = client.save().unwrap();
        client.clear();
        assert_eq!(client.amount(), 0);

        client.load(&blob).unwrap();
        assert_eq!(client.amount(), BATCH_SIZE);
        issuer.verify(&client.get_token().unwrap()).unwrap();
    }

    #[test]
    fn corrupt_blob_leaves_storage_untouched() {
        let (issuer, client) = issuer_and_client();
        run_batch(&issuer, &client);

        // Build a blob with one forged signature.
        let mut storage: Vec<PBlindToken> = Vec::new();
        for _ in 0..2 {
            let token = client.get_token().unwrap();
            storage.push(PBlindToken::unpack(&token.data).unwrap());
        }
        storage[1].token.0[3] ^= 0x01;
        let blob = pack_cbor(&PBlindStorage { storage }).unwrap();

        let before = client.amount();
        assert!(matches!(client.load(&blob), Err(Error::TokenInvalid)));
        assert_eq!(client.amount(), before);

        // The remaining stored tokens are still spendable.
        issuer.verify(&client.get_token().unwrap()).unwrap();
    }

    #[test]
    fn low_storage_signals_restock() {
        let secret = PBlindSecretKey::generate();
        let signals = Arc::new(AtomicUsize::new(0));
        let signals2 = signals.clone();

        let issuer = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-256".into(),
            private_key: secret.to_base58(),
            use_serials: true,
            batch_size: BATCH_SIZE,
            ..PBlindOptions::default()
        })
        .unwrap();
        let client = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-256".into(),
            public_key: secret.public_key().to_base58(),
            use_serials: true,
            batch_size: BATCH_SIZE,
            signal_should_request: Some(Arc::new(move |_handler| {
                signals2.fetch_add(1, Ordering::SeqCst);
            })),
            ..PBlindOptions::default()
        })
        .unwrap();

        run_batch(&issuer, &client);
        assert!(!client.should_request());

        // 16 / 1 > 10 only once a single token remains.
        for _ in 0..BATCH_SIZE {
            let _ = client.get_token().unwrap();
        }
        assert!(client.should_request());
        assert!(signals.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn batch_shape_violations_abort() {
        let (issuer, client) = issuer_and_client();

        let (mut state, mut setup) = issuer.create_setup().unwrap();

        // Wrong slot count.
        let short = PBlindSetupResponse {
            msgs: setup.msgs[..BATCH_SIZE - 1].to_vec(),
        };
        assert!(matches!(
            client.create_token_request(&short),
            Err(Error::BatchMismatch(_))
        ));

        // Empty slot.
        setup.msgs[3] = None;
        assert!(matches!(
            client.create_token_request(&setup),
            Err(Error::MissingSlot(3))
        ));

        // Issuing against a mismatched request fails too.
        let request = PBlindTokenRequest { msgs: Vec::new() };
        assert!(matches!(
            issuer.issue_tokens(&mut state, &request),
            Err(Error::BatchMismatch(_))
        ));

        // Storage was never touched.
        assert_eq!(client.amount(), 0);
    }

    #[test]
    fn randomized_batches_keep_all_serials() {
        let secret = PBlindSecretKey::generate();
        let issuer = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-256".into(),
            private_key: secret.to_base58(),
            use_serials: true,
            batch_size: BATCH_SIZE,
            ..PBlindOptions::default()
        })
        .unwrap();
        let client = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-256".into(),
            public_key: secret.public_key().to_base58(),
            use_serials: true,
            batch_size: BATCH_SIZE,
            randomize_order: true,
            ..PBlindOptions::default()
        })
        .unwrap();

        run_batch(&issuer, &client);

        let mut serials = Vec::new();
        while let Ok(token) = client.get_token() {
            issuer.verify(&token).unwrap();
            serials.push(PBlindToken::unpack(&token.data).unwrap().serial);
        }
        serials.sort_unstable();
        assert_eq!(serials, (1..=BATCH_SIZE as u64).collect::<Vec<_>>());
    }

    #[test]
    fn unimplemented_curves_are_refused() {
        let result = PBlindHandler::new(PBlindOptions {
            zone: "test".into(),
            curve_name: "P-384".into(),
            public_key: PBlindSecretKey::generate().public_key().to_base58(),
            batch_size: BATCH_SIZE,
            ..PBlindOptions::default()
        });
        assert!(matches!(result, Err(Error::UnsupportedCurve(_))));
    }
}

//! The crane: handshake, workers, and terminal multiplexing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use spn_core::msg::parse_id_type;
use spn_core::terminal::{CraneTerminal, TerminalBase, TerminalOpts};
use spn_core::{Container, Error, MsgType, Result};
use spn_crypto::session::{parse_letter, EncryptionSession};
use spn_hub::{import_and_verify_hub_info, Hub, Identity};
use spn_transport::Ship;

use crate::controller;
use crate::metrics::CraneMetrics;
use crate::reassembly::BlockReassembler;

/// Crane init message types, bit-exact on the wire.
pub(crate) const MSG_TYPE_END: u8 = 0;
pub(crate) const MSG_TYPE_INFO: u8 = 1;
pub(crate) const MSG_TYPE_REQUEST_HUB_INFO: u8 = 2;
pub(crate) const MSG_TYPE_VERIFY: u8 = 3;
pub(crate) const MSG_TYPE_START_ENCRYPTED: u8 = 4;
pub(crate) const MSG_TYPE_START_UNENCRYPTED: u8 = 5;

/// Per-step handshake deadline.
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the loader keeps gathering before flushing a small shipment.
const COALESCE_WINDOW: Duration = Duration::from_millis(5);

/// Bytes reserved in a shipment for the length prefix and padding marker.
const PADDING_RESERVE: usize = 8;

/// Local build information served on `Info` requests.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VersionInfo {
    /// Software name.
    pub name: String,
    /// Software version.
    pub version: String,
}

/// Callback receiving hub documents pushed by the peer.
pub type HubInfoCallback = Arc<dyn Fn(Hub) + Send + Sync>;

/// Construction options for a crane.
#[derive(Clone)]
pub struct CraneOpts {
    /// Administrative map scope.
    pub map: String,
    /// Coalescing target for outgoing shipments; defaults to 3072.
    pub optimal_min_load_size: Option<usize>,
    /// Options for the controller terminal.
    pub controller: TerminalOpts,
    /// Receives verified hub info pushed through the controller.
    pub on_hub_info: Option<HubInfoCallback>,
}

impl Default for CraneOpts {
    fn default() -> Self {
        Self {
            map: "main".into(),
            optimal_min_load_size: None,
            controller: TerminalOpts {
                padding: 8,
                ..TerminalOpts::default()
            },
            on_hub_info: None,
        }
    }
}

/// A channel to one remote hub, multiplexing terminals over one ship.
pub struct Crane {
    id: String,
    opts: CraneOpts,
    ship: Arc<dyn Ship>,
    identity: Option<Arc<Identity>>,
    connected_hub: Mutex<Option<Hub>>,
    session: OnceLock<EncryptionSession>,
    controller: OnceLock<Arc<TerminalBase>>,
    terminals: Mutex<HashMap<u32, Arc<dyn CraneTerminal>>>,

    submit_tx: mpsc::Sender<Container>,
    submit_rx: Mutex<Option<mpsc::Receiver<Container>>>,
    unloading_tx: mpsc::Sender<Container>,
    unloading_rx: Mutex<Option<mpsc::Receiver<Container>>>,

    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    stop_reason: Mutex<Option<Error>>,
    metrics: Arc<CraneMetrics>,
}

impl Crane {
    /// Create a crane on the given ship.
    ///
    /// `connected_hub` is required on the initiating side of insecure
    /// ships; `identity` on the accepting side of them.
    pub fn new(
        ship: Arc<dyn Ship>,
        connected_hub: Option<Hub>,
        identity: Option<Arc<Identity>>,
        opts: CraneOpts,
        metrics: Arc<CraneMetrics>,
    ) -> Arc<Self> {
        let (submit_tx, submit_rx) = mpsc::channel(256);
        let (unloading_tx, unloading_rx) = mpsc::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        let id: String = {
            let mut rng = rand::thread_rng();
            (0..8)
                .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
                .collect()
        };

        Arc::new(Self {
            id,
            opts,
            ship,
            identity,
            connected_hub: Mutex::new(connected_hub),
            session: OnceLock::new(),
            controller: OnceLock::new(),
            terminals: Mutex::new(HashMap::new()),
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            unloading_tx,
            unloading_rx: Mutex::new(Some(unloading_rx)),
            shutdown_tx,
            stopped: AtomicBool::new(false),
            stop_reason: Mutex::new(None),
            metrics,
        })
    }

    /// Short random crane ID used in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn opts(&self) -> &CraneOpts {
        &self.opts
    }

    /// The controller terminal; available once the crane is operational.
    pub fn controller(&self) -> Option<&Arc<TerminalBase>> {
        self.controller.get()
    }

    /// The hub this crane is connected to, as far as known.
    pub fn connected_hub(&self) -> Option<Hub> {
        self.lock_hub().clone()
    }

    /// The stop reason, once stopped.
    pub fn stop_reason(&self) -> Option<Error> {
        self.stop_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Whether the crane was stopped.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The channel terminals submit framed messages into.
    pub fn submit_channel(&self) -> mpsc::Sender<Container> {
        self.submit_tx.clone()
    }

    /// A shutdown signal following this crane's lifecycle.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Install a terminal under its ID.
    pub fn add_terminal(&self, terminal: Arc<dyn CraneTerminal>) {
        self.lock_terminals().insert(terminal.id(), terminal);
    }

    /// Remove a terminal.
    pub fn remove_terminal(&self, id: u32) -> Option<Arc<dyn CraneTerminal>> {
        self.lock_terminals().remove(&id)
    }

    /// Run the handshake and enter operation.
    ///
    /// On return the three workers are running; errors have already
    /// stopped the crane.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(crane = %self.id, mine = self.ship.is_mine(), "crane starting");
        self.metrics.record_start();

        tokio::spawn(self.clone().unloader());

        let result = if self.ship.is_mine() {
            self.start_local().await
        } else {
            self.start_remote().await
        };

        if let Err(err) = result {
            self.stop(err.clone());
            return Err(err);
        }

        tokio::spawn(self.clone().loader());
        tokio::spawn(self.clone().handler());

        debug!(crane = %self.id, "crane operational");
        Ok(())
    }

    /// Stop the crane, abandoning all terminals. Idempotent.
    pub fn stop(self: &Arc<Self>, err: Error) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if err.is_stopping() {
            info!(crane = %self.id, "crane stopping");
        } else {
            warn!(crane = %self.id, %err, "crane stopped");
        }
        *self.stop_reason.lock().unwrap_or_else(|p| p.into_inner()) = Some(err.clone());
        self.metrics.record_stop();

        // Best-effort end frame; the ship may already be gone.
        let ship = self.ship.clone();
        let load_size = self.ship.load_size();
        tokio::spawn(async move {
            let mut end = Container::new();
            end.append_number(u64::from(MSG_TYPE_END));
            end.prepend_length();
            end.append_number(0);
            end.append(&vec![0u8; load_size.saturating_sub(end.length())]);
            let _ = timeout(Duration::from_secs(1), ship.load(&end.compile_data())).await;
        });

        let terminals: Vec<_> = self.lock_terminals().drain().collect();
        for (_, terminal) in terminals {
            terminal.handle_remote_stop(err.clone());
        }

        let _ = self.shutdown_tx.send(true);
    }

    // === Handshake, initiating side ===

    async fn start_local(self: &Arc<Self>) -> Result<()> {
        let mut unloading = self.take_unloading()?;
        let mut letter_signet_id = None;

        if !self.ship.is_secure() {
            let expected_id = {
                let hub = self.lock_hub();
                hub.as_ref()
                    .map(|hub| hub.id.clone())
                    .ok_or_else(|| {
                        Error::IncorrectUsage(
                            "cannot start encrypted channel without connected hub".into(),
                        )
                    })?
            };

            // Always refresh hub info; the hub may have restarted and lost
            // its ephemeral keys in the meantime.
            let mut request = Container::new();
            request.append_number(u64::from(MSG_TYPE_REQUEST_HUB_INFO));
            request.prepend_length();
            self.load_to_ship(&mut request).await?;

            let mut reply = self.await_block(&mut unloading).await?;
            let announcement = reply
                .get_next_block()
                .map_err(|err| Error::MalformedData(format!("failed to get announcement: {err}")))?;
            let status = reply
                .get_next_block()
                .map_err(|err| Error::MalformedData(format!("failed to get status: {err}")))?;

            let hub = import_and_verify_hub_info(
                Some(&expected_id),
                announcement.as_slice(),
                status.as_slice(),
                &self.opts.map,
            )
            .map_err(|err| Error::MalformedData(format!("failed to import hub info: {err}")))?;

            let signet = hub
                .select_signet()
                .cloned()
                .ok_or_else(|| Error::HubNotReady("no usable exchange key published".into()))?;
            *self.lock_hub() = Some(hub);

            let (session, ephemeral) = EncryptionSession::initiate(&signet.key)
                .map_err(|err| Error::InternalError(format!("failed to create session: {err}")))?;
            self.session
                .set(session)
                .map_err(|_| Error::InternalError("session already established".into()))?;
            letter_signet_id = Some((signet.id, ephemeral));
        }

        // Set up the controller and its init payload.
        let (controller, mut init_data) = controller::new_local_controller(self, self.opts.controller);
        self.install_controller(controller);

        match letter_signet_id {
            None => {
                init_data.prepend_number(u64::from(MSG_TYPE_START_UNENCRYPTED));
            }
            Some((signet_id, ephemeral)) => {
                let ciphertext = self
                    .session
                    .get()
                    .ok_or_else(|| Error::InternalError("session not established".into()))?
                    .seal(&init_data.compile_data())
                    .map_err(|err| Error::InternalError(format!("failed to seal init: {err}")))?;

                let mut letter = Container::new();
                letter.append_as_block(signet_id.as_bytes());
                letter.append(&ephemeral);
                letter.append(&ciphertext);
                letter.prepend_number(u64::from(MSG_TYPE_START_ENCRYPTED));
                init_data = letter;
            }
        }

        init_data.prepend_length();
        self.load_to_ship(&mut init_data).await?;

        self.put_back_unloading(unloading);
        Ok(())
    }

    // === Handshake, accepting side ===

    async fn start_remote(self: &Arc<Self>) -> Result<()> {
        let mut unloading = self.take_unloading()?;

        let init_msg = loop {
            let mut request = self.await_block(&mut unloading).await?;
            let msg_type = request
                .get_next_n8()
                .map_err(|err| Error::MalformedData(format!("bad crane msg type: {err}")))?;

            match msg_type {
                MSG_TYPE_END => return Err(Error::Stopping),
                MSG_TYPE_INFO => {
                    self.handle_info_request().await?;
                    debug!(crane = %self.id, "sent version info");
                }
                MSG_TYPE_REQUEST_HUB_INFO => {
                    self.handle_hub_info_request().await?;
                    debug!(crane = %self.id, "sent hub info");
                }
                MSG_TYPE_VERIFY => {
                    self.handle_verify_request(&mut request).await?;
                    debug!(crane = %self.id, "sent identity verification");
                }
                MSG_TYPE_START_UNENCRYPTED => {
                    debug!(crane = %self.id, "peer initiated unencrypted channel");
                    break request;
                }
                MSG_TYPE_START_ENCRYPTED => {
                    let init = self.accept_encrypted_start(&mut request)?;
                    debug!(crane = %self.id, "peer initiated encrypted channel");
                    break init;
                }
                other => {
                    return Err(Error::MalformedData(format!("unknown crane msg type {other}")))
                }
            }
        };

        let controller = controller::new_remote_controller(self, init_msg)?;
        self.install_controller(controller);

        self.put_back_unloading(unloading);
        Ok(())
    }

    fn accept_encrypted_start(&self, request: &mut Container) -> Result<Container> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            Error::IncorrectUsage("cannot accept encrypted crane without designated identity".into())
        })?;

        let signet_block = request
            .get_next_block()
            .map_err(|err| Error::MalformedData(format!("bad letter signet: {err}")))?;
        let signet_id = String::from_utf8(signet_block.compile_data())
            .map_err(|_| Error::MalformedData("letter signet ID is not utf-8".into()))?;

        let exchange = identity
            .exchange_pair(&signet_id)
            .map_err(|err| Error::HubNotReady(err.to_string()))?;

        let (ephemeral, ciphertext) = parse_letter(request.as_slice())
            .map_err(|err| Error::MalformedData(format!("bad letter: {err}")))?;
        let session = EncryptionSession::accept(&exchange, &ephemeral)
            .map_err(|err| Error::InternalError(format!("failed to accept session: {err}")))?;

        let init_data = session
            .open(ciphertext)
            .map_err(|err| Error::Integrity(format!("failed to open init: {err}")))?;
        self.session
            .set(session)
            .map_err(|_| Error::InternalError("session already established".into()))?;

        Ok(Container::from_data(init_data))
    }

    async fn handle_info_request(&self) -> Result<()> {
        let info = VersionInfo {
            name: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
        };
        let mut body = Vec::new();
        ciborium::ser::into_writer(&info, &mut body)
            .map_err(|err| Error::InternalError(format!("failed to pack info: {err}")))?;

        let mut reply = Container::from_data(body);
        reply.prepend_length();
        self.load_to_ship(&mut reply).await
    }

    async fn handle_hub_info_request(&self) -> Result<()> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            Error::IncorrectUsage("cannot serve hub info without designated identity".into())
        })?;

        let announcement = identity
            .export_announcement()
            .map_err(|err| Error::InternalError(format!("failed to export announcement: {err}")))?;
        let status = identity
            .export_status()
            .map_err(|err| Error::InternalError(format!("failed to export status: {err}")))?;

        let mut reply = Container::new();
        reply.append_as_block(&announcement);
        reply.append_as_block(&status);
        reply.prepend_length();
        self.load_to_ship(&mut reply).await
    }

    async fn handle_verify_request(&self, request: &mut Container) -> Result<()> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            Error::IncorrectUsage("cannot verify identity without designated identity".into())
        })?;

        let challenge = request
            .get_next_block()
            .map_err(|err| Error::MalformedData(format!("bad verify challenge: {err}")))?;
        let (key, signature) = identity.sign_challenge(challenge.as_slice());

        let mut reply = Container::new();
        reply.append_as_block(&key);
        reply.append_as_block(&signature);
        reply.prepend_length();
        self.load_to_ship(&mut reply).await
    }

    // === Workers ===

    async fn unloader(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut reassembler = BlockReassembler::new(self.ship.load_size());

        loop {
            let chunk = tokio::select! {
                chunk = self.ship.unload() => chunk,
                _ = shutdown.wait_for(|stopped| *stopped) => return,
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.stop(Error::ShipSunk(err.to_string()));
                    return;
                }
            };

            let blocks = match reassembler.push_chunk(&chunk) {
                Ok(blocks) => blocks,
                Err(err) => {
                    self.stop(err);
                    return;
                }
            };
            for block in blocks {
                self.metrics.record_unload();
                if self.unloading_tx.send(block).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn loader(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let Ok(mut submit_rx) = self.take_submit() else {
            return;
        };
        let load_size = self.ship.load_size();
        let optimal_min = self.opts.optimal_min_load_size.unwrap_or(3072);

        loop {
            let first = tokio::select! {
                maybe = submit_rx.recv() => maybe,
                _ = shutdown.wait_for(|stopped| *stopped) => return,
            };
            let Some(first) = first else { return };

            let mut shipment = Container::new();
            shipment.append_container(&first);

            // Coalesce briefly to amortize ship writes.
            let deadline = Instant::now() + COALESCE_WINDOW;
            while shipment.length() + PADDING_RESERVE < optimal_min {
                match tokio::time::timeout_at(deadline, submit_rx.recv()).await {
                    Ok(Some(next)) => shipment.append_container(&next),
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            if let Some(session) = self.session.get() {
                match session.seal(&shipment.compile_data()) {
                    Ok(sealed) => shipment = Container::from_data(sealed),
                    Err(err) => {
                        self.stop(Error::InternalError(format!("failed to seal shipment: {err}")));
                        return;
                    }
                }
            }

            shipment.prepend_length();
            if let Err(err) = self.load_to_ship(&mut shipment).await {
                self.stop(err);
                return;
            }
        }
    }

    async fn handler(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let Ok(mut unloading_rx) = self.take_unloading() else {
            return;
        };

        loop {
            let block = tokio::select! {
                maybe = unloading_rx.recv() => maybe,
                _ = shutdown.wait_for(|stopped| *stopped) => return,
            };
            let Some(block) = block else { return };

            if let Err(err) = self.handle_block(block) {
                self.stop(err);
                return;
            }
        }
    }

    fn handle_block(self: &Arc<Self>, block: Container) -> Result<()> {
        let mut payload = match self.session.get() {
            Some(session) => Container::from_data(
                session
                    .open(block.as_slice())
                    .map_err(|err| Error::Integrity(format!("failed to open shipment: {err}")))?,
            ),
            None => block,
        };

        while payload.holds_data() {
            let len = payload.get_next_n32()? as usize;
            if len == 0 {
                // Remainder is padding.
                break;
            }
            let mut msg = Container::from_data(payload.get_next(len)?);
            let (id, msg_type) = parse_id_type(&mut msg)?;

            match msg_type {
                MsgType::Data => {
                    let terminal = self.lock_terminals().get(&id).cloned();
                    match terminal {
                        Some(terminal) => {
                            if let Err(err) = terminal.deliver(msg) {
                                warn!(crane = %self.id, terminal = id, %err, "delivery failed");
                                self.abandon_terminal(id, err);
                            }
                        }
                        None => debug!(crane = %self.id, terminal = id, "data for unknown terminal"),
                    }
                }
                MsgType::Init => {
                    // Terminal establishment policy lives outside the
                    // crane; unsolicited inits are dropped.
                    debug!(crane = %self.id, terminal = id, "discarding unsolicited terminal init");
                }
                MsgType::Stop => {
                    let code = msg.get_next_n8()?;
                    if let Some(terminal) = self.remove_terminal(id) {
                        terminal.handle_remote_stop(Error::from_code(code));
                    }
                }
            }
        }
        Ok(())
    }

    /// Abandon one terminal, leaving the crane and its peers running.
    pub fn abandon_terminal(&self, id: u32, err: Error) {
        if let Some(terminal) = self.remove_terminal(id) {
            terminal.abandon(err);
        }
    }

    // === Plumbing ===

    async fn await_block(&self, unloading: &mut mpsc::Receiver<Container>) -> Result<Container> {
        match timeout(HANDSHAKE_STEP_TIMEOUT, unloading.recv()).await {
            Ok(Some(block)) => Ok(block),
            Ok(None) => Err(Error::ShipSunk("unloader gone".into())),
            Err(_) => Err(Error::Timeout("waiting for crane init msg".into())),
        }
    }

    /// Pad to a load-size multiple and write to the ship.
    ///
    /// Every emission is padded so the stream offset stays aligned to
    /// load-size boundaries, which the receiving reassembler relies on
    /// when skipping padding.
    async fn load_to_ship(&self, c: &mut Container) -> Result<()> {
        let load_size = self.ship.load_size();
        let remainder = c.length() % load_size;
        if remainder != 0 {
            let pad = load_size - remainder;
            c.append_number(0);
            if pad > 1 {
                c.append(&vec![0u8; pad - 1]);
            }
        }

        let data = c.compile_data();
        self.ship
            .load(&data)
            .await
            .map_err(|err| Error::ShipSunk(err.to_string()))?;
        self.metrics.record_load(data.len());
        Ok(())
    }

    fn install_controller(&self, controller: Arc<TerminalBase>) {
        self.add_terminal(controller.clone());
        let _ = self.controller.set(controller);
    }

    fn take_unloading(&self) -> Result<mpsc::Receiver<Container>> {
        self.unloading_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| Error::InternalError("unloading channel already taken".into()))
    }

    fn put_back_unloading(&self, rx: mpsc::Receiver<Container>) {
        *self.unloading_rx.lock().unwrap_or_else(|p| p.into_inner()) = Some(rx);
    }

    fn take_submit(&self) -> Result<mpsc::Receiver<Container>> {
        self.submit_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| Error::InternalError("submit channel already taken".into()))
    }

    fn lock_hub(&self) -> std::sync::MutexGuard<'_, Option<Hub>> {
        self.connected_hub.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_terminals(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<dyn CraneTerminal>>> {
        self.terminals.lock().unwrap_or_else(|p| p.into_inner())
    }
}

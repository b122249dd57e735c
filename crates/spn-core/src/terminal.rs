//! Terminal base — one multiplexed session inside a crane.
//!
//! A terminal owns a [`DuplexFlowQueue`] and a registry of operations.
//! Operation messages reuse the terminal wire framing one level down:
//! the terminal's data payload is a sequence of length-prefixed
//! `[opID|Type][body]` messages, terminated early by a zero-length
//! padding marker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::flow::{DuplexFlowQueue, DEFAULT_QUEUE_SIZE};
use crate::msg::{add_id_type, make_msg, parse_id_type, MsgType};
use crate::{Container, Error, Result};

/// Upper bound on one batched operation shipment.
const MAX_SHIPMENT_SIZE: usize = 4096;

/// Resolves once `shutdown` is signalled, without exposing the watch
/// channel's internal guard type to callers holding this future across
/// other `select!` branches.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Routing interface the crane uses to address a terminal.
pub trait CraneTerminal: Send + Sync {
    /// The terminal ID (a multiple of 4).
    fn id(&self) -> u32;

    /// Human-readable ID for logging.
    fn fmt_id(&self) -> String;

    /// Deliver the payload of a terminal data message.
    fn deliver(&self, c: Container) -> Result<()>;

    /// Abandon the terminal with the given stop reason.
    fn abandon(&self, err: Error);

    /// Handle a stop frame sent by the peer.
    ///
    /// The default mirrors [`CraneTerminal::abandon`]; flow terminals
    /// override this to avoid echoing a stop frame back.
    fn handle_remote_stop(&self, err: Error) {
        self.abandon(err);
    }
}

/// Construction options for a terminal.
#[derive(Debug, Clone, Copy)]
pub struct TerminalOpts {
    /// Capacity of the flow queues in containers.
    pub queue_size: u32,
    /// Pad operation shipments to a multiple of this size; 0 disables.
    pub padding: u32,
}

impl Default for TerminalOpts {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            padding: 0,
        }
    }
}

/// An application-level request or stream running inside a terminal.
pub trait Operation: Send + Sync {
    /// Deliver a data message to the operation.
    ///
    /// Must not block; the terminal's receive path runs through here.
    /// Spawn a task for anything that needs to wait.
    fn deliver(&self, c: Container) -> Result<()>;

    /// The operation has ended; `err` carries the peer's stop reason.
    fn end(&self, err: Option<Error>);
}

/// Constructor for remotely initiated operations.
///
/// Receives the operation context and the remaining init data.
pub type OpFactory =
    Arc<dyn Fn(OpContext, &mut Container) -> Result<Arc<dyn Operation>> + Send + Sync>;

struct OpMsg {
    op_id: u32,
    msg_type: MsgType,
    data: Container,
}

/// Handle an operation uses to talk through its terminal.
#[derive(Clone)]
pub struct OpContext {
    op_id: u32,
    terminal_label: Arc<str>,
    flow: Arc<DuplexFlowQueue>,
    op_tx: mpsc::Sender<OpMsg>,
    shutdown: watch::Receiver<bool>,
}

impl OpContext {
    /// The operation ID within its terminal.
    pub fn id(&self) -> u32 {
        self.op_id
    }

    /// Human-readable ID for logging.
    pub fn fmt_id(&self) -> String {
        format!("{}>{}", self.terminal_label, self.op_id)
    }

    /// Wait until the flow queue has credit to send.
    pub async fn ready_to_send(&self) {
        self.flow.ready_to_send().await;
    }

    /// Send a data message to the remote counterpart.
    pub async fn send_data(&self, data: Container) -> Result<()> {
        self.send_msg(MsgType::Data, data).await
    }

    /// End the operation, carrying an optional error to the peer.
    pub async fn stop(&self, err: Option<Error>) -> Result<()> {
        let mut data = Container::new();
        data.append_number(u64::from(err.map(|e| e.code()).unwrap_or(0)));
        self.send_msg(MsgType::Stop, data).await
    }

    /// Resolve when the terminal is shutting down.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        let _ = shutdown.wait_for(|stopped| *stopped).await;
    }

    async fn send_msg(&self, msg_type: MsgType, data: Container) -> Result<()> {
        self.op_tx
            .send(OpMsg {
                op_id: self.op_id,
                msg_type,
                data,
            })
            .await
            .map_err(|_| Error::Stopping)
    }
}

/// The shared terminal implementation used by flow-controlled terminals.
pub struct TerminalBase {
    id: u32,
    label: Arc<str>,
    opts: TerminalOpts,
    flow: Arc<DuplexFlowQueue>,
    upstream: mpsc::Sender<Container>,
    op_tx: mpsc::Sender<OpMsg>,
    ops: Mutex<HashMap<u32, Arc<dyn Operation>>>,
    factories: Mutex<HashMap<String, OpFactory>>,
    next_op_id: AtomicU32,
    abandoning: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TerminalBase {
    /// Create a terminal and spawn its flow and message workers.
    ///
    /// `upstream` is the crane's submit channel; `crane_shutdown` stops the
    /// terminal together with its crane. The initiating side allocates
    /// different operation IDs than the accepting side so concurrent
    /// starts cannot collide.
    pub fn new(
        id: u32,
        label: impl Into<String>,
        opts: TerminalOpts,
        upstream: mpsc::Sender<Container>,
        mut crane_shutdown: watch::Receiver<bool>,
        is_initiator: bool,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // The terminal dies with its crane.
        let inherited = shutdown_tx.clone();
        tokio::spawn(async move {
            if crane_shutdown.wait_for(|stopped| *stopped).await.is_ok() {
                let _ = inherited.send(true);
            }
        });

        let (flow, flow_worker, recv_rx) =
            DuplexFlowQueue::new(id, opts.queue_size, upstream.clone(), shutdown_rx.clone());
        let (op_tx, op_rx) = mpsc::channel(256);

        let terminal = Arc::new(Self {
            id,
            label: Arc::from(label.into()),
            opts,
            flow,
            upstream,
            op_tx,
            ops: Mutex::new(HashMap::new()),
            factories: Mutex::new(HashMap::new()),
            next_op_id: AtomicU32::new(if is_initiator { 8 } else { 12 }),
            abandoning: AtomicBool::new(false),
            shutdown_tx,
        });

        tokio::spawn(flow_worker.run());
        // Receiving and sending run independently: the receive path must
        // keep draining even while sending waits on flow credit, or two
        // saturated directions could starve each other's space reports.
        tokio::spawn(terminal.clone().recv_worker(recv_rx, shutdown_rx.clone()));
        tokio::spawn(terminal.clone().send_worker(op_rx, shutdown_rx));

        terminal
    }

    /// The construction options of this terminal.
    pub fn opts(&self) -> TerminalOpts {
        self.opts
    }

    /// The flow queue of this terminal.
    pub fn flow(&self) -> &Arc<DuplexFlowQueue> {
        &self.flow
    }

    /// Register a constructor for remotely initiated operations.
    pub fn register_factory(&self, op_type: &str, factory: OpFactory) {
        self.factories
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(op_type.to_string(), factory);
    }

    /// Allocate the context for a locally initiated operation.
    pub fn new_op_context(&self) -> OpContext {
        OpContext {
            op_id: self.next_op_id.fetch_add(8, Ordering::SeqCst),
            terminal_label: self.label.clone(),
            flow: self.flow.clone(),
            op_tx: self.op_tx.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        }
    }

    /// Start a locally initiated operation.
    ///
    /// Sends the init message `[type block][init data]` and registers the
    /// operation for delivery.
    pub async fn start_operation(
        &self,
        ctx: &OpContext,
        op_type: &str,
        init_data: Container,
        op: Arc<dyn Operation>,
    ) -> Result<()> {
        self.ops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(ctx.op_id, op);

        let mut init = Container::new();
        init.append_as_block(op_type.as_bytes());
        init.append_container(&init_data);
        self.op_tx
            .send(OpMsg {
                op_id: ctx.op_id,
                msg_type: MsgType::Init,
                data: init,
            })
            .await
            .map_err(|_| Error::Stopping)
    }

    /// Wait until all queued messages were handed to the crane.
    pub async fn flush(&self) {
        self.flow.flush().await;
    }

    async fn recv_worker(
        self: Arc<Self>,
        mut recv_rx: mpsc::Receiver<Container>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = recv_rx.recv() => {
                    let Some(c) = maybe else { return };
                    self.flow.note_dequeued();
                    if let Err(err) = self.handle_incoming(c) {
                        warn!(terminal = %self.label, %err, "terminal failed, abandoning");
                        self.abandon(err);
                        return;
                    }
                }
                _ = shutdown.wait_for(|stopped| *stopped) => {
                    debug!(terminal = %self.label, stats = %self.flow.flow_stats(), "terminal recv worker exiting");
                    return;
                }
            }
        }
    }

    async fn send_worker(
        self: Arc<Self>,
        mut op_rx: mpsc::Receiver<OpMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = op_rx.recv() => {
                    let Some(msg) = maybe else { return };
                    if self.ship_op_msgs(msg, &mut op_rx).await.is_err() {
                        return;
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => return,
            }
        }
    }

    /// Parse one received terminal payload into operation messages.
    fn handle_incoming(&self, mut c: Container) -> Result<()> {
        while c.holds_data() {
            let len = c.get_next_n32()? as usize;
            if len == 0 {
                // Remainder is padding.
                break;
            }
            let mut msg = Container::from_data(c.get_next(len)?);
            let (op_id, msg_type) = parse_id_type(&mut msg)?;
            match msg_type {
                MsgType::Init => self.handle_op_init(op_id, &mut msg)?,
                MsgType::Data => {
                    let op = self.op(op_id);
                    match op {
                        Some(op) => {
                            if let Err(err) = op.deliver(msg) {
                                self.finish_op(op_id, Some(err));
                            }
                        }
                        None => debug!(terminal = %self.label, op_id, "data for unknown operation"),
                    }
                }
                MsgType::Stop => {
                    let code = msg.get_next_n8()?;
                    let err = (code != 0).then(|| Error::from_code(code));
                    if let Some(op) = self.remove_op(op_id) {
                        op.end(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_op_init(&self, op_id: u32, init: &mut Container) -> Result<()> {
        let name_block = init.get_next_block()?;
        let op_type = String::from_utf8(name_block.compile_data())
            .map_err(|_| Error::MalformedData("operation type is not utf-8".into()))?;

        let factory = self
            .factories
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&op_type)
            .cloned();
        let Some(factory) = factory else {
            warn!(terminal = %self.label, %op_type, "unknown operation type");
            let ctx = self.remote_op_context(op_id);
            tokio::spawn(async move {
                let _ = ctx
                    .stop(Some(Error::IncorrectUsage("unknown operation type".into())))
                    .await;
            });
            return Ok(());
        };

        let ctx = self.remote_op_context(op_id);
        match factory(ctx, init) {
            Ok(op) => {
                self.ops
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(op_id, op);
            }
            Err(err) => {
                // A refused operation is not a terminal fault.
                debug!(terminal = %self.label, op_id, %err, "operation start refused");
                let ctx = self.remote_op_context(op_id);
                tokio::spawn(async move {
                    let _ = ctx.stop(Some(err)).await;
                });
            }
        }
        Ok(())
    }

    fn remote_op_context(&self, op_id: u32) -> OpContext {
        OpContext {
            op_id,
            terminal_label: self.label.clone(),
            flow: self.flow.clone(),
            op_tx: self.op_tx.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        }
    }

    /// Batch outbound operation messages into one padded shipment.
    async fn ship_op_msgs(&self, first: OpMsg, op_rx: &mut mpsc::Receiver<OpMsg>) -> Result<()> {
        let mut shipment = Container::new();
        let mut next = Some(first);

        while let Some(msg) = next.take() {
            if msg.msg_type == MsgType::Stop {
                // The local side initiated the stop; release the slot.
                self.remove_op(msg.op_id);
            }
            let mut framed = msg.data;
            add_id_type(&mut framed, msg.op_id, msg.msg_type);
            framed.prepend_length();
            shipment.append_container(&framed);

            if shipment.length() >= MAX_SHIPMENT_SIZE {
                break;
            }
            next = op_rx.try_recv().ok();
        }

        self.add_padding(&mut shipment);
        self.flow.send(shipment).await
    }

    fn add_padding(&self, shipment: &mut Container) {
        if self.opts.padding == 0 {
            return;
        }
        let padding = self.opts.padding as usize;
        let needed = (padding - (shipment.length() % padding)) % padding;
        if needed == 0 {
            return;
        }
        // Padding marker, then random filler.
        shipment.append_number(0);
        if needed > 1 {
            let mut filler = vec![0u8; needed - 1];
            rand::thread_rng().fill_bytes(&mut filler);
            shipment.append(&filler);
        }
    }

    fn op(&self, op_id: u32) -> Option<Arc<dyn Operation>> {
        self.ops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&op_id)
            .cloned()
    }

    fn remove_op(&self, op_id: u32) -> Option<Arc<dyn Operation>> {
        self.ops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&op_id)
    }

    fn finish_op(&self, op_id: u32, err: Option<Error>) {
        if let Some(op) = self.remove_op(op_id) {
            op.end(err.clone());
        }
        let ctx = self.remote_op_context(op_id);
        tokio::spawn(async move {
            let _ = ctx.stop(err).await;
        });
    }

    fn abandon_with(&self, err: Error, send_stop_frame: bool) {
        if self.abandoning.swap(true, Ordering::SeqCst) {
            return;
        }
        if err.is_stopping() {
            debug!(terminal = %self.label, "terminal stopping");
        } else {
            warn!(terminal = %self.label, %err, "terminal abandoned");
        }

        if send_stop_frame {
            let mut c = Container::new();
            c.append_number(u64::from(err.code()));
            make_msg(&mut c, self.id, MsgType::Stop);
            let _ = self.upstream.try_send(c);
        }

        let ops: Vec<_> = self
            .ops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        for (_, op) in ops {
            op.end(Some(Error::Stopping));
        }

        let _ = self.shutdown_tx.send(true);
    }
}

impl CraneTerminal for TerminalBase {
    fn id(&self) -> u32 {
        self.id
    }

    fn fmt_id(&self) -> String {
        self.label.to_string()
    }

    fn deliver(&self, c: Container) -> Result<()> {
        self.flow.deliver(c)
    }

    fn abandon(&self, err: Error) {
        self.abandon_with(err, true);
    }

    fn handle_remote_stop(&self, err: Error) {
        self.abandon_with(err, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct RecordingOp {
        delivered: AtomicU64,
        ended: AtomicBool,
    }

    impl Operation for RecordingOp {
        fn deliver(&self, c: Container) -> Result<()> {
            assert_eq!(c.compile_data(), b"ping");
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn end(&self, _err: Option<Error>) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    fn test_terminal() -> (
        Arc<TerminalBase>,
        mpsc::Receiver<Container>,
        watch::Sender<bool>,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (upstream_tx, upstream_rx) = mpsc::channel(64);
        let terminal = TerminalBase::new(
            8,
            "test#8",
            TerminalOpts {
                queue_size: 16,
                padding: 0,
            },
            upstream_tx,
            shutdown_rx,
            true,
        );
        (terminal, upstream_rx, shutdown_tx)
    }

    fn op_payload(mut crane_msg: Container) -> Container {
        // Unwrap [len][ID|Type][addSpace][op msgs...] down to the op msgs.
        let mut block = crane_msg.get_next_block().unwrap();
        let (id, msg_type) = parse_id_type(&mut block).unwrap();
        assert_eq!(id, 8);
        assert_eq!(msg_type, MsgType::Data);
        block.get_next_n16().unwrap();
        block
    }

    #[tokio::test]
    async fn operation_init_and_data_round_trip() {
        let (terminal, mut upstream, _shutdown) = test_terminal();

        let op = Arc::new(RecordingOp {
            delivered: AtomicU64::new(0),
            ended: AtomicBool::new(false),
        });
        let ctx = terminal.new_op_context();
        terminal
            .start_operation(&ctx, "recording", Container::new(), op.clone())
            .await
            .unwrap();
        ctx.send_data(Container::from_data(b"ping".to_vec()))
            .await
            .unwrap();

        // Both messages appear upstream, op-framed inside terminal frames.
        let mut seen_init = false;
        let mut seen_data = false;
        while !(seen_init && seen_data) {
            let mut payload = op_payload(upstream.recv().await.unwrap());
            while payload.holds_data() {
                let len = payload.get_next_n32().unwrap() as usize;
                if len == 0 {
                    break;
                }
                let mut msg = Container::from_data(payload.get_next(len).unwrap());
                let (op_id, msg_type) = parse_id_type(&mut msg).unwrap();
                assert_eq!(op_id, ctx.id());
                match msg_type {
                    MsgType::Init => {
                        let name = msg.get_next_block().unwrap();
                        assert_eq!(name.compile_data(), b"recording");
                        seen_init = true;
                    }
                    MsgType::Data => {
                        assert_eq!(msg.compile_data(), b"ping");
                        seen_data = true;
                    }
                    MsgType::Stop => panic!("unexpected stop"),
                }
            }
        }
    }

    #[tokio::test]
    async fn incoming_init_uses_factory() {
        let (terminal, mut upstream, _shutdown) = test_terminal();

        let created: Arc<Mutex<Vec<Arc<RecordingOp>>>> = Arc::new(Mutex::new(Vec::new()));
        let created2 = created.clone();
        terminal.register_factory(
            "recording",
            Arc::new(move |_ctx, _init| {
                let op = Arc::new(RecordingOp {
                    delivered: AtomicU64::new(0),
                    ended: AtomicBool::new(false),
                });
                created2.lock().unwrap().push(op.clone());
                Ok(op as Arc<dyn Operation>)
            }),
        );

        // Remote init for op 12, then data, then stop.
        let mut payload = Container::new();
        let mut init = Container::new();
        init.append_as_block(b"recording");
        add_id_type(&mut init, 12, MsgType::Init);
        init.prepend_length();
        payload.append_container(&init);

        let mut data = Container::from_data(b"ping".to_vec());
        add_id_type(&mut data, 12, MsgType::Data);
        data.prepend_length();
        payload.append_container(&data);

        let mut stop = Container::new();
        stop.append_number(0);
        add_id_type(&mut stop, 12, MsgType::Stop);
        stop.prepend_length();
        payload.append_container(&stop);

        // Wrap as a delivered terminal data payload (space grant first).
        payload.prepend_number(0);
        terminal.deliver(payload).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            {
                let ops = created.lock().unwrap();
                if ops.len() == 1
                    && ops[0].delivered.load(Ordering::SeqCst) == 1
                    && ops[0].ended.load(Ordering::SeqCst)
                {
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "op never processed");
            tokio::task::yield_now().await;
        }
        drop(upstream.try_recv());
    }

    #[tokio::test]
    async fn padding_rounds_shipments() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (upstream_tx, mut upstream_rx) = mpsc::channel(64);
        let terminal = TerminalBase::new(
            8,
            "test#8",
            TerminalOpts {
                queue_size: 16,
                padding: 32,
            },
            upstream_tx,
            shutdown_rx,
            true,
        );

        let ctx = terminal.new_op_context();
        ctx.send_data(Container::from_data(b"x".to_vec()))
            .await
            .unwrap();

        let payload = op_payload(upstream_rx.recv().await.unwrap());
        assert_eq!(payload.length() % 32, 0);
        drop(shutdown_tx);
    }

    #[tokio::test]
    async fn abandon_sends_stop_frame_once() {
        let (terminal, mut upstream, _shutdown) = test_terminal();

        terminal.abandon(Error::QueueOverflow);
        terminal.abandon(Error::QueueOverflow);

        let mut frame = upstream.recv().await.unwrap();
        let mut block = frame.get_next_block().unwrap();
        let (id, msg_type) = parse_id_type(&mut block).unwrap();
        assert_eq!(id, 8);
        assert_eq!(msg_type, MsgType::Stop);
        assert_eq!(block.get_next_n8().unwrap(), Error::QueueOverflow.code());
        assert!(upstream.try_recv().is_err());
    }
}

//! The controller terminal and its maintenance operations.
//!
//! Every crane carries the controller at terminal ID 0. It is an ordinary
//! flow terminal whose operation registry holds the maintenance set:
//! latency measurement, capacity measurement, hub info push, and the
//! counter used by the test suite.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use spn_core::counter::{CounterOp, COUNTER_OP_TYPE};
use spn_core::terminal::{OpContext, Operation, OpFactory, TerminalBase, TerminalOpts};
use spn_core::{Container, Error, Result};
use spn_hub::{import_and_verify_hub_info, Identity};

use crate::crane::Crane;

/// Operation type name of the latency test.
pub const LATENCY_OP_TYPE: &str = "latency";
/// Operation type name of the capacity test.
pub const CAPACITY_OP_TYPE: &str = "capacity";
/// Operation type name of the hub info push.
pub const HUB_INFO_OP_TYPE: &str = "hubinfo";

/// Build the local controller and its init payload for the start message.
pub(crate) fn new_local_controller(
    crane: &Arc<Crane>,
    opts: TerminalOpts,
) -> (Arc<TerminalBase>, Container) {
    let controller = build_controller(crane, opts, true);
    let mut init = Container::new();
    init.append_number(u64::from(opts.queue_size));
    init.append_number(u64::from(opts.padding));
    (controller, init)
}

/// Build the remote controller from a received init payload.
pub(crate) fn new_remote_controller(
    crane: &Arc<Crane>,
    mut init: Container,
) -> Result<Arc<TerminalBase>> {
    let opts = TerminalOpts {
        queue_size: init.get_next_n32()?,
        padding: init.get_next_n32()?,
    };
    Ok(build_controller(crane, opts, false))
}

fn build_controller(crane: &Arc<Crane>, opts: TerminalOpts, is_initiator: bool) -> Arc<TerminalBase> {
    let controller = TerminalBase::new(
        0,
        format!("{}#0", crane.id()),
        opts,
        crane.submit_channel(),
        crane.shutdown_signal(),
        is_initiator,
    );

    controller.register_factory(COUNTER_OP_TYPE, CounterOp::factory());
    controller.register_factory(LATENCY_OP_TYPE, LatencyOp::factory());
    controller.register_factory(
        CAPACITY_OP_TYPE,
        CapacityOp::factory(Arc::new(AtomicBool::new(false))),
    );

    let map = crane.opts().map.clone();
    let on_hub_info = crane.opts().on_hub_info.clone();
    controller.register_factory(
        HUB_INFO_OP_TYPE,
        Arc::new(move |ctx, _init| {
            Ok(Arc::new(HubInfoSink {
                ctx,
                map: map.clone(),
                on_hub_info: on_hub_info.clone(),
            }) as Arc<dyn Operation>)
        }),
    );

    controller
}

// === Latency ===

/// Measures round-trip latency with sequenced echo pings.
pub struct LatencyOp {
    ctx: OpContext,
    rounds: u64,
    pong_tx: mpsc::Sender<u64>,
    result: Mutex<Option<Duration>>,
    error: Mutex<Option<Error>>,
    done: watch::Sender<bool>,
}

impl LatencyOp {
    /// Start a latency measurement of `rounds` sequential pings.
    pub async fn attach(terminal: &TerminalBase, rounds: u64) -> Result<Arc<Self>> {
        let ctx = terminal.new_op_context();
        let (pong_tx, pong_rx) = mpsc::channel(1);
        let op = Arc::new(Self {
            ctx: ctx.clone(),
            rounds,
            pong_tx,
            result: Mutex::new(None),
            error: Mutex::new(None),
            done: watch::channel(false).0,
        });

        let mut init = Container::new();
        init.append_number(rounds);
        terminal
            .start_operation(&ctx, LATENCY_OP_TYPE, init, op.clone())
            .await?;

        tokio::spawn(op.clone().run(pong_rx));
        Ok(op)
    }

    /// Echo factory for the accepting side.
    pub fn factory() -> OpFactory {
        Arc::new(|ctx, _init| Ok(Arc::new(LatencyEcho { ctx }) as Arc<dyn Operation>))
    }

    /// Wait for the measurement; returns the mean round-trip time.
    pub async fn wait(&self) -> Result<Duration> {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        if let Some(err) = self.error.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(err);
        }
        self.result
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ok_or_else(|| Error::InternalError("latency result missing".into()))
    }

    async fn run(self: Arc<Self>, mut pong_rx: mpsc::Receiver<u64>) {
        let started = Instant::now();
        for seq in 1..=self.rounds {
            let mut ping = Container::new();
            ping.append_number(seq);
            let mut nonce = [0u8; 8];
            rand::thread_rng().fill_bytes(&mut nonce);
            ping.append(&nonce);

            if self.ctx.send_data(ping).await.is_err() {
                self.finish(Err(Error::Stopping));
                return;
            }

            match tokio::time::timeout(Duration::from_secs(10), pong_rx.recv()).await {
                Ok(Some(echoed)) if echoed == seq => {}
                Ok(Some(echoed)) => {
                    self.finish(Err(Error::MalformedData(format!(
                        "latency echo out of order: expected {seq}, got {echoed}"
                    ))));
                    return;
                }
                Ok(None) => {
                    self.finish(Err(Error::Stopping));
                    return;
                }
                Err(_) => {
                    self.finish(Err(Error::Timeout("latency echo".into())));
                    return;
                }
            }
        }
        self.finish(Ok(started.elapsed() / self.rounds.max(1) as u32));
    }

    fn finish(&self, result: Result<Duration>) {
        match result {
            Ok(rtt) => {
                *self.result.lock().unwrap_or_else(|p| p.into_inner()) = Some(rtt);
            }
            Err(err) => {
                *self.error.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
            }
        }
        let _ = self.done.send(true);

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _ = ctx.stop(None).await;
        });
    }
}

impl Operation for LatencyOp {
    fn deliver(&self, mut c: Container) -> Result<()> {
        let seq = c.get_next_n64()?;
        let _ = self.pong_tx.try_send(seq);
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        if let Some(err) = err {
            *self.error.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
            let _ = self.done.send(true);
        }
    }
}

struct LatencyEcho {
    ctx: OpContext,
}

impl Operation for LatencyEcho {
    fn deliver(&self, c: Container) -> Result<()> {
        // Echo the ping unchanged; one ping is in flight at a time.
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _ = ctx.send_data(c).await;
        });
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {}
}

// === Capacity ===

/// Result of a capacity measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityReport {
    /// Bytes acknowledged by the peer.
    pub bytes: u64,
    /// Wall time of the transfer in milliseconds.
    pub millis: u64,
}

/// Measures one-directional bulk throughput.
pub struct CapacityOp {
    ctx: OpContext,
    count: u64,
    payload_size: u64,
    report_tx: mpsc::Sender<u64>,
    result: Mutex<Option<CapacityReport>>,
    error: Mutex<Option<Error>>,
    done: watch::Sender<bool>,
}

impl CapacityOp {
    /// Start a capacity measurement sending `count` payloads of
    /// `payload_size` bytes.
    pub async fn attach(terminal: &TerminalBase, count: u64, payload_size: u64) -> Result<Arc<Self>> {
        let ctx = terminal.new_op_context();
        let (report_tx, report_rx) = mpsc::channel(1);
        let op = Arc::new(Self {
            ctx: ctx.clone(),
            count,
            payload_size,
            report_tx,
            result: Mutex::new(None),
            error: Mutex::new(None),
            done: watch::channel(false).0,
        });

        let mut init = Container::new();
        init.append_number(count);
        init.append_number(payload_size);
        terminal
            .start_operation(&ctx, CAPACITY_OP_TYPE, init, op.clone())
            .await?;

        tokio::spawn(op.clone().run(report_rx));
        Ok(op)
    }

    /// Counting-sink factory for the accepting side.
    ///
    /// `busy` limits the crane to one concurrent capacity test; further
    /// starts are refused with [`Error::TryAgainLater`].
    pub fn factory(busy: Arc<AtomicBool>) -> OpFactory {
        Arc::new(move |ctx, init| {
            if busy.swap(true, Ordering::SeqCst) {
                return Err(Error::TryAgainLater("capacity test already running".into()));
            }
            let count = init.get_next_n64()?;
            let _payload_size = init.get_next_n64()?;
            Ok(Arc::new(CapacitySink {
                ctx,
                expected: count,
                received: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
                busy: busy.clone(),
            }) as Arc<dyn Operation>)
        })
    }

    /// Wait for the measurement report.
    pub async fn wait(&self) -> Result<CapacityReport> {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        if let Some(err) = self.error.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(err);
        }
        self.result
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ok_or_else(|| Error::InternalError("capacity result missing".into()))
    }

    async fn run(self: Arc<Self>, mut report_rx: mpsc::Receiver<u64>) {
        let started = Instant::now();
        let payload = vec![0u8; self.payload_size as usize];

        for _ in 0..self.count {
            self.ctx.ready_to_send().await;
            if self
                .ctx
                .send_data(Container::from_data(payload.clone()))
                .await
                .is_err()
            {
                self.finish(Err(Error::Stopping));
                return;
            }
        }

        match tokio::time::timeout(Duration::from_secs(30), report_rx.recv()).await {
            Ok(Some(bytes)) => {
                self.finish(Ok(CapacityReport {
                    bytes,
                    millis: started.elapsed().as_millis() as u64,
                }));
            }
            Ok(None) => self.finish(Err(Error::Stopping)),
            Err(_) => self.finish(Err(Error::Timeout("capacity report".into()))),
        }
    }

    fn finish(&self, result: Result<CapacityReport>) {
        match result {
            Ok(report) => {
                *self.result.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
            }
            Err(err) => {
                *self.error.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
            }
        }
        let _ = self.done.send(true);

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let _ = ctx.stop(None).await;
        });
    }
}

impl Operation for CapacityOp {
    fn deliver(&self, mut c: Container) -> Result<()> {
        let bytes = c.get_next_n64()?;
        let _ = self.report_tx.try_send(bytes);
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        if let Some(err) = err {
            *self.error.lock().unwrap_or_else(|p| p.into_inner()) = Some(err);
            let _ = self.done.send(true);
        }
    }
}

struct CapacitySink {
    ctx: OpContext,
    expected: u64,
    received: AtomicU64,
    bytes: AtomicU64,
    busy: Arc<AtomicBool>,
}

impl Operation for CapacitySink {
    fn deliver(&self, c: Container) -> Result<()> {
        self.bytes.fetch_add(c.length() as u64, Ordering::SeqCst);
        let received = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        if received == self.expected {
            let bytes = self.bytes.load(Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let mut report = Container::new();
                report.append_number(bytes);
                let _ = ctx.send_data(report).await;
            });
        }
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

// === Hub info push ===

/// Push the local identity's hub documents to the peer for gossip.
pub async fn push_hub_info(terminal: &TerminalBase, identity: &Identity) -> Result<()> {
    let announcement = identity
        .export_announcement()
        .map_err(|err| Error::InternalError(format!("failed to export announcement: {err}")))?;
    let status = identity
        .export_status()
        .map_err(|err| Error::InternalError(format!("failed to export status: {err}")))?;

    let ctx = terminal.new_op_context();
    let op = Arc::new(HubInfoPush);
    terminal
        .start_operation(&ctx, HUB_INFO_OP_TYPE, Container::new(), op)
        .await?;

    let mut msg = Container::new();
    msg.append_as_block(&announcement);
    msg.append_as_block(&status);
    ctx.send_data(msg).await?;
    terminal.flush().await;
    ctx.stop(None).await
}

struct HubInfoPush;

impl Operation for HubInfoPush {
    fn deliver(&self, _c: Container) -> Result<()> {
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {}
}

struct HubInfoSink {
    ctx: OpContext,
    map: String,
    on_hub_info: Option<crate::crane::HubInfoCallback>,
}

impl Operation for HubInfoSink {
    fn deliver(&self, mut c: Container) -> Result<()> {
        let announcement = c.get_next_block()?;
        let status = c.get_next_block()?;
        let hub = import_and_verify_hub_info(
            None,
            announcement.as_slice(),
            status.as_slice(),
            &self.map,
        )
        .map_err(|err| Error::MalformedData(format!("hub info push rejected: {err}")))?;

        debug!(op = %self.ctx.fmt_id(), hub = %hub.id, "received hub info push");
        if let Some(on_hub_info) = &self.on_hub_info {
            on_hub_info(hub);
        }
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {}
}

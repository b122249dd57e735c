//! Duplex flow queue — credit-based bidirectional flow control.
//!
//! Every flow-controlled terminal owns one [`DuplexFlowQueue`]. The local
//! `send_space` mirrors the number of containers the peer is still willing
//! to accept; it is replenished exclusively by `AddAvailableSpace` varints
//! riding on the peer's data messages, or on standalone space reports.
//! Receive-side credit is granted lazily: a report is forced only once the
//! space the peer knows about falls below 75% of the queue capacity, which
//! bounds peer stalls without per-message report chatter.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::msg::{make_msg, MsgType};
use crate::{Container, Error, Result};

/// Default queue capacity in containers.
pub const DEFAULT_QUEUE_SIZE: u32 = 50_000;

/// Hard upper bound on the queue capacity.
pub const MAX_QUEUE_SIZE: u32 = 1_000_000;

/// Force a space report when the reported space falls below this share of
/// the queue capacity.
const FORCE_REPORT_BELOW: f32 = 0.75;

/// A single space report is capped by the 16-bit wire field; larger
/// backlogs are reported across multiple frames.
const MAX_SINGLE_REPORT: i32 = u16::MAX as i32;

/// Resolves once `shutdown` is signalled, without exposing the watch
/// channel's internal guard type to callers holding this future across
/// other `select!` branches.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Credit-controlled channel pair of one terminal.
pub struct DuplexFlowQueue {
    terminal_id: u32,
    queue_size: u32,

    // Senders into the bounded queues; the receivers live in the flow
    // worker (send side) and the terminal worker (recv side).
    send_tx: mpsc::Sender<Container>,
    recv_tx: mpsc::Sender<Container>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    force_report_tx: mpsc::Sender<()>,

    // Remaining credit to send; mirrors free peer receive slots.
    send_space: AtomicI32,
    // Credit the peer has been told about. May drift low, never high.
    reported_space: AtomicI32,

    wake_sender: Notify,
    // Serializes the compute-and-publish step of space reporting.
    space_report_lock: Mutex<()>,

    shutdown: watch::Receiver<bool>,
}

impl DuplexFlowQueue {
    /// Create a flow queue for the given terminal.
    ///
    /// Returns the queue handle, the worker that must be spawned, and the
    /// receive-side channel to be drained by the terminal.
    pub fn new(
        terminal_id: u32,
        queue_size: u32,
        upstream: mpsc::Sender<Container>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, FlowWorker, mpsc::Receiver<Container>) {
        let queue_size = queue_size.clamp(1, MAX_QUEUE_SIZE);
        let (send_tx, send_rx) = mpsc::channel(queue_size as usize);
        let (recv_tx, recv_rx) = mpsc::channel(queue_size as usize);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (force_report_tx, force_report_rx) = mpsc::channel(1);

        let dfq = Arc::new(Self {
            terminal_id,
            queue_size,
            send_tx,
            recv_tx,
            flush_tx,
            force_report_tx,
            send_space: AtomicI32::new(queue_size as i32),
            reported_space: AtomicI32::new(queue_size as i32),
            wake_sender: Notify::new(),
            space_report_lock: Mutex::new(()),
            shutdown: shutdown.clone(),
        });

        let worker = FlowWorker {
            dfq: dfq.clone(),
            upstream,
            send_rx,
            flush_rx,
            force_report_rx,
            shutdown,
        };

        (dfq, worker, recv_rx)
    }

    /// The queue capacity in containers.
    pub fn queue_size(&self) -> u32 {
        self.queue_size
    }

    /// Current credit to send to the peer.
    pub fn send_space(&self) -> i32 {
        self.send_space.load(Ordering::SeqCst)
    }

    fn decrement_send_space(&self) -> i32 {
        self.send_space.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn add_to_send_space(&self, n: i32) {
        self.send_space.fetch_add(n, Ordering::SeqCst);
        self.wake_sender.notify_waiters();
    }

    fn should_report_recv_space(&self) -> bool {
        self.reported_space.load(Ordering::SeqCst) < self.force_report_threshold()
    }

    /// Decrease the reported recv space by one and return whether a report
    /// should now be forced.
    fn decrement_reported_recv_space(&self) -> bool {
        self.reported_space.fetch_sub(1, Ordering::SeqCst) - 1 < self.force_report_threshold()
    }

    fn force_report_threshold(&self) -> i32 {
        (self.queue_size as f32 * FORCE_REPORT_BELOW) as i32
    }

    /// Compute how much free receive space can be reported to the peer and
    /// account for it as reported. The returned number must reach the peer.
    fn reportable_recv_space(&self) -> i32 {
        // Queue movement during the calculation is harmless; reporting the
        // same space twice is not, hence the lock.
        let _guard = self
            .space_report_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let free = self.recv_tx.capacity() as i32;
        let reported = self.reported_space.load(Ordering::SeqCst);
        let mut to_report = free - reported;

        // The reported space is decremented after a container is queued in
        // deliver(), so this difference can transiently read one too low.
        // Values of one are not worth a report either, so both cases share
        // one cutoff.
        if to_report <= 1 {
            return 0;
        }
        if to_report > MAX_SINGLE_REPORT {
            to_report = MAX_SINGLE_REPORT;
        }

        self.reported_space.fetch_add(to_report, Ordering::SeqCst);
        to_report
    }

    /// Wait until there is credit to send.
    ///
    /// Returns immediately if `send_space` is positive; otherwise resolves
    /// once the peer grants new space. Callers may gate expensive payload
    /// construction on this.
    pub async fn ready_to_send(&self) {
        loop {
            if self.send_space() > 0 {
                return;
            }
            let wake = self.wake_sender.notified();
            tokio::pin!(wake);
            // Register before the re-check so no grant can slip through.
            wake.as_mut().enable();
            if self.send_space() > 0 {
                return;
            }
            wake.await;
        }
    }

    /// Queue a container for flow-controlled sending.
    ///
    /// Applies backpressure once the send queue is full.
    pub async fn send(&self, c: Container) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            res = self.send_tx.send(c) => res.map_err(|_| Error::Stopping),
            _ = shutdown.wait_for(|stopped| *stopped) => Err(Error::Stopping),
        }
    }

    /// Submit a container received from upstream.
    ///
    /// Called by the crane handler. Parses the leading space grant, queues
    /// remaining payload without blocking, and returns
    /// [`Error::QueueOverflow`] if the peer exceeded its credit.
    pub fn deliver(&self, mut c: Container) -> Result<()> {
        let add_space = c
            .get_next_n16()
            .map_err(|err| Error::MalformedData(format!("failed to parse space grant: {err}")))?;
        if add_space > 0 {
            self.add_to_send_space(i32::from(add_space));
        }
        // Pure space report, nothing to queue.
        if !c.holds_data() {
            return Ok(());
        }

        match self.recv_tx.try_send(c) {
            Ok(()) => {
                if self.decrement_reported_recv_space() {
                    let _ = self.force_report_tx.try_send(());
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // The whole point of the flow queue is that this is
                // unreachable against a correct peer.
                Err(Error::QueueOverflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Stopping),
        }
    }

    /// Note that a container was taken out of the receive queue; forces a
    /// space report if the peer's known credit is running low.
    pub fn note_dequeued(&self) {
        if self.should_report_recv_space() {
            let _ = self.force_report_tx.try_send(());
        }
    }

    /// Wait until everything queued at call time has been handed upstream.
    ///
    /// Returns early without guarantees when the queue is shutting down.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            res = self.flush_tx.send(tx) => {
                if res.is_err() {
                    return;
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => return,
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = rx => {}
            _ = shutdown.wait_for(|stopped| *stopped) => {}
        }
    }

    /// k=v formatted internal stats for debug logging.
    pub fn flow_stats(&self) -> String {
        format!(
            "sq={} rq={} sends={} reps={}",
            self.queue_size as usize - self.send_tx.capacity(),
            self.queue_size as usize - self.recv_tx.capacity(),
            self.send_space.load(Ordering::SeqCst),
            self.reported_space.load(Ordering::SeqCst),
        )
    }
}

/// The per-queue worker driving sending and space reporting.
///
/// Must be spawned once per flow queue.
pub struct FlowWorker {
    dfq: Arc<DuplexFlowQueue>,
    upstream: mpsc::Sender<Container>,
    send_rx: mpsc::Receiver<Container>,
    flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
    force_report_rx: mpsc::Receiver<()>,
    shutdown: watch::Receiver<bool>,
}

impl FlowWorker {
    /// Run until shutdown or queue closure.
    pub async fn run(mut self) {
        let mut send_space_depleted = false;
        let mut flush_finished: Vec<oneshot::Sender<()>> = Vec::new();
        let mut shutdown = self.shutdown.clone();

        loop {
            // With depleted credit, only wake-ups and forced reports are
            // serviced; data stays queued.
            if send_space_depleted {
                let wake = self.dfq.wake_sender.notified();
                tokio::pin!(wake);
                // Register before the re-check so no grant can slip through.
                wake.as_mut().enable();
                if self.dfq.send_space() > 0 {
                    send_space_depleted = false;
                    continue;
                }
                tokio::select! {
                    _ = &mut wake => {
                        if self.dfq.send_space() > 0 {
                            send_space_depleted = false;
                        }
                    }
                    _ = self.force_report_rx.recv() => {
                        // No credit is needed, a report carries no data.
                        self.submit_space_report().await;
                    }
                    _ = wait_for_shutdown(&mut shutdown) => return,
                }
                continue;
            }

            tokio::select! {
                maybe = self.send_rx.recv() => {
                    let Some(mut c) = maybe else { return };

                    // Ride the current space grant on this data message.
                    c.prepend_number(self.dfq.reportable_recv_space() as u64);
                    if self.submit(c).await.is_err() {
                        return;
                    }

                    if self.dfq.decrement_send_space() <= 0 {
                        send_space_depleted = true;
                    }

                    if !flush_finished.is_empty() && self.send_rx.is_empty() {
                        for finished in flush_finished.drain(..) {
                            let _ = finished.send(());
                        }
                    }
                }
                _ = self.force_report_rx.recv() => {
                    self.submit_space_report().await;
                }
                maybe = self.flush_rx.recv() => {
                    let Some(finished) = maybe else { return };
                    if self.send_rx.is_empty() {
                        let _ = finished.send(());
                    } else {
                        flush_finished.push(finished);
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => return,
            }
        }
    }

    async fn submit_space_report(&self) {
        let space = self.dfq.reportable_recv_space();
        if space > 0 {
            let mut report = Container::new();
            report.append_number(space as u64);
            let _ = self.submit(report).await;
        }
    }

    async fn submit(&self, mut c: Container) -> Result<()> {
        make_msg(&mut c, self.dfq.terminal_id, MsgType::Data);
        self.upstream.send(c).await.map_err(|_| Error::Stopping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::parse_id_type;

    fn test_queue(
        queue_size: u32,
    ) -> (
        Arc<DuplexFlowQueue>,
        mpsc::Receiver<Container>,
        mpsc::Receiver<Container>,
        watch::Sender<bool>,
    ) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (upstream_tx, upstream_rx) = mpsc::channel(64);
        let (dfq, worker, recv_rx) = DuplexFlowQueue::new(8, queue_size, upstream_tx, shutdown_rx);
        tokio::spawn(worker.run());
        (dfq, upstream_rx, recv_rx, shutdown_tx)
    }

    fn unwrap_data_msg(mut c: Container) -> Container {
        let mut block = c.get_next_block().unwrap();
        let (id, msg_type) = parse_id_type(&mut block).unwrap();
        assert_eq!(id, 8);
        assert_eq!(msg_type, MsgType::Data);
        block
    }

    #[tokio::test]
    async fn send_prepends_space_grant() {
        let (dfq, mut upstream, _recv_rx, _shutdown) = test_queue(16);

        dfq.send(Container::from_data(b"hi".to_vec())).await.unwrap();
        let mut msg = unwrap_data_msg(upstream.recv().await.unwrap());

        // Fresh queue: all space already reported, so the grant is zero.
        assert_eq!(msg.get_next_n16().unwrap(), 0);
        assert_eq!(msg.compile_data(), b"hi");

        // The worker decrements the credit after handing the message off.
        for _ in 0..100 {
            if dfq.send_space() == 15 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("send space was not decremented");
    }

    #[tokio::test]
    async fn deliver_grants_send_space_and_queues() {
        let (dfq, _upstream, mut recv_rx, _shutdown) = test_queue(4);

        // Drain the queue to zero credit first.
        for _ in 0..4 {
            dfq.decrement_send_space();
        }
        assert_eq!(dfq.send_space(), 0);

        let mut c = Container::new();
        c.append_number(3);
        c.append(b"payload");
        dfq.deliver(c).unwrap();

        assert_eq!(dfq.send_space(), 3);
        assert_eq!(recv_rx.recv().await.unwrap().compile_data(), b"payload");
    }

    #[tokio::test]
    async fn pure_space_report_is_not_queued() {
        let (dfq, _upstream, mut recv_rx, _shutdown) = test_queue(4);

        let mut report = Container::new();
        report.append_number(2);
        dfq.deliver(report).unwrap();

        assert_eq!(dfq.send_space(), 6);
        assert!(recv_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_is_detected() {
        let (dfq, _upstream, _recv_rx, _shutdown) = test_queue(2);

        for _ in 0..2 {
            let mut c = Container::new();
            c.append_number(0);
            c.append(b"x");
            dfq.deliver(c).unwrap();
        }

        let mut c = Container::new();
        c.append_number(0);
        c.append(b"x");
        assert_eq!(dfq.deliver(c), Err(Error::QueueOverflow));
    }

    #[tokio::test]
    async fn never_reports_one() {
        let (dfq, mut upstream, mut recv_rx, _shutdown) = test_queue(4);

        // Consume one slot of reported space.
        let mut c = Container::new();
        c.append_number(0);
        c.append(b"x");
        dfq.deliver(c).unwrap();
        recv_rx.recv().await.unwrap();

        // One free-but-unreported slot must not produce a report.
        dfq.send(Container::from_data(b"data".to_vec())).await.unwrap();
        let mut msg = unwrap_data_msg(upstream.recv().await.unwrap());
        assert_eq!(msg.get_next_n16().unwrap(), 0);
    }

    #[tokio::test]
    async fn forced_report_after_drain() {
        let (dfq, mut upstream, mut recv_rx, _shutdown) = test_queue(4);

        // Fill the queue: reported space drops to 0, forcing reports.
        for _ in 0..4 {
            let mut c = Container::new();
            c.append_number(0);
            c.append(b"x");
            dfq.deliver(c).unwrap();
        }

        // Drain everything and nudge the reporter.
        for _ in 0..4 {
            recv_rx.recv().await.unwrap();
            dfq.note_dequeued();
        }

        // The standalone report grants the freed slots.
        let mut msg = unwrap_data_msg(upstream.recv().await.unwrap());
        let granted = msg.get_next_n16().unwrap();
        assert!(granted >= 2, "got grant of {granted}");
        assert!(!msg.holds_data());
    }

    #[tokio::test]
    async fn flush_fires_once_queue_drains() {
        let (dfq, mut upstream, _recv_rx, _shutdown) = test_queue(8);

        dfq.send(Container::from_data(b"a".to_vec())).await.unwrap();
        dfq.flush().await;

        // The message was handed upstream before flush returned.
        assert!(upstream.try_recv().is_ok());
    }

    #[tokio::test]
    async fn ready_to_send_waits_for_credit() {
        let (dfq, _upstream, _recv_rx, _shutdown) = test_queue(2);

        for _ in 0..2 {
            dfq.decrement_send_space();
        }

        let dfq2 = dfq.clone();
        let waiter = tokio::spawn(async move { dfq2.ready_to_send().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        dfq.add_to_send_space(1);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("ready_to_send should resolve")
            .unwrap();
    }
}

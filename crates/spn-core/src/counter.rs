//! Counter operation — the bidirectional throughput exemplar.
//!
//! Both sides stream strictly increasing counters at each other until the
//! configured targets are reached. Any gap or reordering fails the
//! operation, which makes the counter a whole-pipeline check: framing,
//! flow control, coalescing, and padding all have to be correct for it to
//! complete.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;

use crate::terminal::{OpContext, Operation, OpFactory, TerminalBase};
use crate::{Container, Error, Result};

/// Operation type name of the counter.
pub const COUNTER_OP_TYPE: &str = "counter";

/// Counting targets for both directions.
#[derive(Debug, Clone, Copy)]
pub struct CounterOpts {
    /// How far the initiating side counts.
    pub client_count_to: u64,
    /// How far the accepting side counts.
    pub server_count_to: u64,
}

/// A running counter operation.
pub struct CounterOp {
    ctx: OpContext,
    send_target: u64,
    recv_target: u64,
    is_client: bool,
    sent: AtomicU64,
    received: AtomicU64,
    finished: AtomicBool,
    error: Mutex<Option<Error>>,
    done: watch::Sender<bool>,
}

impl CounterOp {
    /// Start a counter on the given terminal (initiating side).
    pub async fn attach(terminal: &TerminalBase, opts: CounterOpts) -> Result<Arc<Self>> {
        let ctx = terminal.new_op_context();
        let op = Arc::new(Self::new(ctx.clone(), opts, true));

        let mut init = Container::new();
        init.append_number(opts.client_count_to);
        init.append_number(opts.server_count_to);
        terminal
            .start_operation(&ctx, COUNTER_OP_TYPE, init, op.clone())
            .await?;

        tokio::spawn(op.clone().run_sender());
        Ok(op)
    }

    /// Factory for the accepting side; register under [`COUNTER_OP_TYPE`].
    pub fn factory() -> OpFactory {
        Arc::new(|ctx, init| {
            let opts = CounterOpts {
                client_count_to: init.get_next_n64()?,
                server_count_to: init.get_next_n64()?,
            };
            let op = Arc::new(CounterOp::new(ctx, opts, false));
            tokio::spawn(op.clone().run_sender());
            Ok(op as Arc<dyn Operation>)
        })
    }

    fn new(ctx: OpContext, opts: CounterOpts, is_client: bool) -> Self {
        let (send_target, recv_target) = if is_client {
            (opts.client_count_to, opts.server_count_to)
        } else {
            (opts.server_count_to, opts.client_count_to)
        };
        Self {
            ctx,
            send_target,
            recv_target,
            is_client,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            error: Mutex::new(None),
            done: watch::channel(false).0,
        }
    }

    /// Wait for the operation to finish and return its error, if any.
    pub async fn wait(&self) -> Option<Error> {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
        self.error()
    }

    /// The error the operation ended with, if any.
    pub fn error(&self) -> Option<Error> {
        self.error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The highest counter value received so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    async fn run_sender(self: Arc<Self>) {
        for value in 1..=self.send_target {
            self.ctx.ready_to_send().await;

            let mut c = Container::new();
            c.append_number(value);
            if self.ctx.send_data(c).await.is_err() {
                self.finish(Some(Error::Stopping));
                return;
            }
            self.sent.store(value, Ordering::SeqCst);
        }
        debug!(op = %self.ctx.fmt_id(), count = self.send_target, "counter done sending");
        self.maybe_finish();
    }

    fn maybe_finish(&self) {
        if self.sent.load(Ordering::SeqCst) >= self.send_target
            && self.received.load(Ordering::SeqCst) >= self.recv_target
        {
            self.finish(None);
        }
    }

    fn finish(&self, err: Option<Error>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.error.lock().unwrap_or_else(|p| p.into_inner()) = err.clone();
        let _ = self.done.send(true);

        // The initiating side releases the remote slot.
        if self.is_client {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let _ = ctx.stop(err).await;
            });
        }
    }
}

impl Operation for CounterOp {
    fn deliver(&self, mut c: Container) -> Result<()> {
        let value = c.get_next_n64()?;
        let expected = self.received.load(Ordering::SeqCst) + 1;
        if value != expected {
            let err = Error::MalformedData(format!(
                "counter mismatch: expected {expected}, got {value}"
            ));
            self.finish(Some(err.clone()));
            return Err(err);
        }
        self.received.store(value, Ordering::SeqCst);
        self.maybe_finish();
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        // A clean remote stop after both targets is a normal finish.
        match err {
            Some(err) if !err.is_stopping() => self.finish(Some(err)),
            _ => self.maybe_finish(),
        }
    }
}

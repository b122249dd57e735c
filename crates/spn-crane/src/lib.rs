//! Cranes — long-lived multiplexed channels between hubs.
//!
//! A crane owns one ship and runs three workers: the unloader reassembles
//! length-framed blocks from ship chunks, the loader coalesces, seals, and
//! pads outgoing shipments, and the handler routes decrypted terminal
//! messages. Between creation and operation sits the init handshake,
//! which establishes the channel encryption unless the ship is already
//! secure.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod controller;
pub mod crane;
pub mod metrics;
mod reassembly;

pub use crane::{Crane, CraneOpts, HubInfoCallback};
pub use metrics::CraneMetrics;

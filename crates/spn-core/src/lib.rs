//! Core protocol engine for the SPN transport substrate.
//!
//! This crate implements the session-layer machinery that a crane
//! multiplexes over a single underlying bytestream:
//! - Byte containers with varint and length-delimited block codecs
//! - Terminal message framing (ID|Type packing)
//! - The duplex flow queue (credit-based flow control)
//! - The terminal base with its operation registry
//! - The protocol error taxonomy with stable wire codes
//!
//! Transport I/O lives in `spn-transport`; the crane itself in `spn-crane`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod container;
pub mod counter;
pub mod error;
pub mod flow;
pub mod msg;
pub mod terminal;

pub use container::Container;
pub use error::{Error, Result};
pub use flow::DuplexFlowQueue;
pub use msg::MsgType;
pub use terminal::{CraneTerminal, Operation, TerminalBase, TerminalOpts};

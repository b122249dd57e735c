//! Ship abstraction — the underlying duplex bytestreams cranes run on.
//!
//! A ship moves opaque byte chunks between exactly two hubs. It knows
//! which side initiated it (`is_mine`), whether it already provides
//! confidentiality (`is_secure`), and its chunk size (`load_size`). The
//! crane layers framing, multiplexing, and optionally encryption on top.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod pipe;
pub mod ship;
pub mod tcp;

pub use error::{Error, Result};
pub use pipe::TestShip;
pub use ship::Ship;
pub use tcp::TcpShip;

//! Hub directory data for the SPN overlay.
//!
//! A hub is known to the network through two signed documents: its
//! announcement (static connection information) and its status (rotating
//! exchange keys). Both are exported as CBOR blocks signed by the hub's
//! identity key; the hub ID is the labeled hash of that key, making the
//! documents self-certifying.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod hub;
pub mod identity;
pub mod lhash;
pub mod transport;

pub use error::{Error, Result};
pub use hub::{import_and_verify_hub_info, parse_bootstrap_hub, Announcement, Hub, SignetEntry, Status};
pub use identity::Identity;
pub use lhash::LabeledHash;
pub use transport::Transport;

//! The ship trait.

use async_trait::async_trait;

use crate::Result;

/// A duplex bytestream between two hubs.
///
/// Incoming bytes arrive in chunks of at most [`Ship::load_size`] bytes,
/// the MTU of the underlying transport. Implementations must be safe to
/// drive from one loading and one unloading task concurrently.
#[async_trait]
pub trait Ship: Send + Sync {
    /// Whether the local side initiated this ship.
    fn is_mine(&self) -> bool;

    /// Whether the transport already provides confidentiality.
    fn is_secure(&self) -> bool;

    /// The chunk size of the underlying transport in bytes.
    fn load_size(&self) -> usize;

    /// Send bytes. Blocks only briefly, bounded by the transport send
    /// buffer; errors mean the ship is unusable.
    async fn load(&self, data: &[u8]) -> Result<()>;

    /// Receive the next chunk of at most [`Ship::load_size`] bytes.
    async fn unload(&self) -> Result<Vec<u8>>;
}

//! In-memory ship for tests and simulations.
//!
//! A [`TestShip`] pair moves chunks through bounded channels, segmenting
//! loads at the configured chunk size exactly like a real transport
//! would. The first ship of a pair reports `is_mine`.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::ship::Ship;
use crate::{Error, Result};

/// Channel depth of one pipe direction, in chunks.
const PIPE_DEPTH: usize = 128;

/// One endpoint of an in-memory ship pair.
pub struct TestShip {
    mine: bool,
    secure: bool,
    load_size: usize,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl TestShip {
    /// Build a connected pair of ships.
    ///
    /// The first endpoint is the initiating side. `secure` marks the
    /// transport as already confidential, letting cranes skip their own
    /// encryption.
    pub fn pair(secure: bool, load_size: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(PIPE_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(PIPE_DEPTH);
        (
            Self {
                mine: true,
                secure,
                load_size,
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                mine: false,
                secure,
                load_size,
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Ship for TestShip {
    fn is_mine(&self) -> bool {
        self.mine
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn load_size(&self) -> usize {
        self.load_size
    }

    async fn load(&self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.load_size) {
            self.tx
                .send(chunk.to_vec())
                .await
                .map_err(|_| Error::Closed("peer endpoint dropped".into()))?;
        }
        Ok(())
    }

    async fn unload(&self) -> Result<Vec<u8>> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Closed("peer endpoint dropped".into()))
    }
}

//! TCP ship over `tokio::net::TcpStream`.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::ship::Ship;
use crate::{Error, Result};

/// Chunk size used for TCP ships.
const TCP_LOAD_SIZE: usize = 4096;

/// A ship over one TCP connection.
pub struct TcpShip {
    mine: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpShip {
    /// Connect to a remote hub.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| Error::ConnectionFailed(format!("connect to {addr}: {err}")))?;
        debug!(%addr, "tcp ship connected");
        Ok(Self::from_stream(stream, true))
    }

    /// Wrap an accepted or established stream.
    ///
    /// `mine` marks the side that initiated the connection.
    pub fn from_stream(stream: TcpStream, mine: bool) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            mine,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Ship for TcpShip {
    fn is_mine(&self) -> bool {
        self.mine
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn load_size(&self) -> usize {
        TCP_LOAD_SIZE
    }

    async fn load(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|err| Error::Closed(format!("write failed: {err}")))
    }

    async fn unload(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; TCP_LOAD_SIZE];
        let mut reader = self.reader.lock().await;
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|err| Error::Closed(format!("read failed: {err}")))?;
        if n == 0 {
            return Err(Error::Closed("connection closed by peer".into()));
        }
        buf.truncate(n);
        Ok(buf)
    }
}

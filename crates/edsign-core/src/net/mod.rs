//! Peer-to-peer message delivery.
//!
//! A [`Gateway`] gives the orchestrator two things: `send` to a peer
//! identity and a processor callback fed with every inbound payload. The
//! transport guarantees authenticated, reliable delivery with FIFO order
//! per peer pair; nothing is assumed across pairs.

pub mod memory;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::key::Identity;

/// Largest payload accepted on the wire.
pub const MAX_PACKET: usize = 1300;

/// A connection is closed when no frame arrives within this window.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound packet handler. Invoked sequentially per connection, so the
/// per-pair FIFO guarantee extends to processing order.
pub type Processor = Arc<dyn Fn(Identity, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Message delivery between identified peers.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send one payload to a peer, dialing it first when needed.
    async fn send(&self, to: &Identity, payload: Vec<u8>) -> Result<()>;

    /// Start delivering inbound packets to the processor. Non-blocking;
    /// only one processor may ever be registered.
    async fn start(&self, processor: Processor) -> Result<()>;

    /// Close every connection and stop listening.
    async fn stop(&self);
}

/// Write one length-prefixed frame: `u32` big-endian length, then payload.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PACKET {
        return Err(Error::Transport(format!(
            "refusing to send {} bytes (limit {MAX_PACKET})",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, enforcing the size limit and the read timeout.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    tokio::time::timeout(READ_TIMEOUT, async {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_PACKET {
            return Err(Error::Transport(format!(
                "peer announced a {len} byte frame (limit {MAX_PACKET})"
            )));
        }
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(payload)
    })
    .await
    .map_err(|_| Error::Transport("read timed out".into()))?
}

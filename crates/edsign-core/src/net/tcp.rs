//! TCP transport.
//!
//! Streams carry the frame format from [`super`]: a hello frame with the
//! dialer's self-signed identity, then protocol frames. The hello check is
//! a development stand-in for the Noise handshake used in production
//! deployments; it authenticates the identity document, not liveness of
//! the key holder.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpListener, TcpStream,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{read_frame, write_frame, Gateway, Processor};
use crate::error::{Error, Result};
use crate::key::{Identity, Private};

const WRITE_QUEUE: usize = 64;

/// Gateway listening on the address of its own identity and dialing peers
/// at the address in theirs.
pub struct TcpGateway {
    inner: Arc<Inner>,
}

struct Inner {
    private: Arc<Private>,
    conns: DashMap<[u8; 32], mpsc::Sender<Vec<u8>>>,
    processor: Mutex<Option<Processor>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TcpGateway {
    pub fn new(private: Arc<Private>) -> Self {
        TcpGateway {
            inner: Arc::new(Inner {
                private,
                conns: DashMap::new(),
                processor: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    async fn connection(&self, to: &Identity) -> Result<mpsc::Sender<Vec<u8>>> {
        if let Some(conn) = self.inner.conns.get(&to.key) {
            return Ok(conn.clone());
        }
        if to.address.is_empty() {
            return Err(Error::Transport(format!(
                "peer {} has no address to dial",
                to.short_id()
            )));
        }
        let mut stream = TcpStream::connect(&to.address).await?;
        let hello = bincode::encode_to_vec(
            self.inner.private.identity(),
            bincode::config::standard(),
        )
        .map_err(|e| Error::Codec(e.to_string()))?;
        write_frame(&mut stream, &hello).await?;
        debug!(peer = to.short_id(), address = %to.address, "dialed peer");
        Ok(attach(&self.inner, to.clone(), stream))
    }
}

#[async_trait]
impl Gateway for TcpGateway {
    async fn send(&self, to: &Identity, payload: Vec<u8>) -> Result<()> {
        let conn = self.connection(to).await?;
        conn.send(payload)
            .await
            .map_err(|_| Error::Transport(format!("connection to {} closed", to.short_id())))
    }

    async fn start(&self, processor: Processor) -> Result<()> {
        {
            let mut slot = self.inner.processor.lock().unwrap();
            if slot.is_some() {
                return Err(Error::Internal("gateway already started".into()));
            }
            *slot = Some(processor);
        }
        let address = self.inner.private.identity().address.clone();
        let listener = TcpListener::bind(&address).await?;
        info!(%address, "listening");

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.accept(stream).await {
                                debug!(%remote, error = %e, "rejected inbound connection");
                            }
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        *self.inner.listener.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = self.inner.listener.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.conns.clear();
    }
}

impl Inner {
    /// Handshake an inbound stream: the first frame must be a self-signed
    /// identity.
    async fn accept(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let hello = read_frame(&mut stream).await?;
        let (identity, _): (Identity, usize) =
            bincode::decode_from_slice(&hello, bincode::config::standard())
                .map_err(|e| Error::Codec(e.to_string()))?;
        identity.verify_self()?;
        debug!(peer = identity.short_id(), "accepted peer connection");
        attach(&self, identity, stream);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, identity: Identity, mut reader: OwnedReadHalf) {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    let processor = self.processor.lock().unwrap().clone();
                    if let Some(processor) = processor {
                        processor(identity.clone(), frame).await;
                    }
                }
                Err(e) => {
                    debug!(peer = identity.short_id(), error = %e, "connection closed");
                    break;
                }
            }
        }
        self.conns.remove(&identity.key);
    }
}

/// Take ownership of an authenticated stream: one writer task draining a
/// queue, one reader task feeding the processor in FIFO order.
fn attach(inner: &Arc<Inner>, identity: Identity, stream: TcpStream) -> mpsc::Sender<Vec<u8>> {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(WRITE_QUEUE);
    inner.conns.insert(identity.key, tx.clone());

    tokio::spawn(write_loop(write_half, rx));
    let inner = inner.clone();
    tokio::spawn(async move {
        inner.read_loop(identity, read_half).await;
    });
    tx
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &payload).await {
            debug!(error = %e, "write failed, dropping connection");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use rand::rngs::OsRng;

    fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn collector() -> (Processor, mpsc::UnboundedReceiver<(Identity, Vec<u8>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let processor: Processor = Arc::new(move |from, payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((from, payload));
            }
            .boxed()
        });
        (processor, rx)
    }

    #[tokio::test]
    async fn peers_exchange_frames_both_ways() {
        let alice = Arc::new(Private::from_seed(rand::Rng::gen(&mut OsRng), &free_address()));
        let bob = Arc::new(Private::from_seed(rand::Rng::gen(&mut OsRng), &free_address()));

        let a = TcpGateway::new(alice.clone());
        let b = TcpGateway::new(bob.clone());
        let (pa, mut rxa) = collector();
        let (pb, mut rxb) = collector();
        a.start(pa).await.unwrap();
        b.start(pb).await.unwrap();

        a.send(bob.identity(), b"ping".to_vec()).await.unwrap();
        let (from, payload) = rxb.recv().await.unwrap();
        assert_eq!(&from, alice.identity());
        assert_eq!(payload, b"ping");

        b.send(alice.identity(), b"pong".to_vec()).await.unwrap();
        let (from, payload) = rxa.recv().await.unwrap();
        assert_eq!(&from, bob.identity());
        assert_eq!(payload, b"pong");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn forged_hello_is_rejected() {
        let bob = Arc::new(Private::from_seed(rand::Rng::gen(&mut OsRng), &free_address()));
        let b = TcpGateway::new(bob.clone());
        let (pb, mut rxb) = collector();
        b.start(pb).await.unwrap();

        // an identity whose self-signature does not cover its claimed key
        let mut forged = Private::generate("forger", &mut OsRng).identity().clone();
        forged.key = Private::generate("other", &mut OsRng).identity().key;
        let mut stream = TcpStream::connect(&bob.identity().address).await.unwrap();
        let hello =
            bincode::encode_to_vec(&forged, bincode::config::standard()).unwrap();
        write_frame(&mut stream, &hello).await.unwrap();
        write_frame(&mut stream, b"should never arrive").await.unwrap();

        tokio::time::timeout(std::time::Duration::from_millis(200), rxb.recv())
            .await
            .expect_err("forged peer must not reach the processor");
        b.stop().await;
    }
}

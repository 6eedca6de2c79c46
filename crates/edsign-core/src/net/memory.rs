//! In-memory gateway for tests and local runs.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Gateway, Processor, MAX_PACKET};
use crate::error::{Error, Result};
use crate::key::Identity;

type Inbox = mpsc::UnboundedSender<(Identity, Vec<u8>)>;

/// Shared hub connecting a set of in-process gateways. Delivery is
/// reliable and FIFO per sender-receiver pair, like the real transport.
#[derive(Clone, Default)]
pub struct MemoryHub {
    peers: Arc<DashMap<[u8; 32], Inbox>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and return its gateway.
    pub fn gateway(&self, identity: Identity) -> MemoryGateway {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(identity.key, tx);
        MemoryGateway {
            hub: self.clone(),
            identity,
            inbox: Mutex::new(Some(rx)),
        }
    }
}

/// One peer's endpoint on a [`MemoryHub`].
pub struct MemoryGateway {
    hub: MemoryHub,
    identity: Identity,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<(Identity, Vec<u8>)>>>,
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn send(&self, to: &Identity, payload: Vec<u8>) -> Result<()> {
        if payload.len() > MAX_PACKET {
            return Err(Error::Transport(format!(
                "refusing to send {} bytes (limit {MAX_PACKET})",
                payload.len()
            )));
        }
        let peer = self
            .hub
            .peers
            .get(&to.key)
            .ok_or_else(|| Error::Transport(format!("peer {} not reachable", to.short_id())))?;
        peer.send((self.identity.clone(), payload))
            .map_err(|_| Error::Transport(format!("peer {} disconnected", to.short_id())))
    }

    async fn start(&self, processor: Processor) -> Result<()> {
        let mut inbox = self
            .inbox
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Internal("gateway already started".into()))?;
        tokio::spawn(async move {
            while let Some((from, payload)) = inbox.recv().await {
                processor(from, payload).await;
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        self.hub.peers.remove(&self.identity.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Private;
    use futures::FutureExt;
    use rand::rngs::OsRng;

    #[tokio::test]
    async fn delivers_in_order_per_pair() {
        let hub = MemoryHub::new();
        let alice = Private::generate("alice", &mut OsRng).identity().clone();
        let bob = Private::generate("bob", &mut OsRng).identity().clone();
        let a = hub.gateway(alice.clone());
        let b = hub.gateway(bob.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.start(Arc::new(move |from, payload| {
            let tx = tx.clone();
            async move {
                tx.send((from, payload)).unwrap();
            }
            .boxed()
        }))
        .await
        .unwrap();

        for i in 0..10u8 {
            a.send(&bob, vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            let (from, payload) = rx.recv().await.unwrap();
            assert_eq!(from, alice);
            assert_eq!(payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn send_fails_after_peer_stops() {
        let hub = MemoryHub::new();
        let alice = Private::generate("alice", &mut OsRng).identity().clone();
        let bob = Private::generate("bob", &mut OsRng).identity().clone();
        let a = hub.gateway(alice);
        let b = hub.gateway(bob.clone());

        a.send(&bob, vec![1]).await.unwrap();
        b.stop().await;
        assert!(a.send(&bob, vec![2]).await.is_err());
    }
}

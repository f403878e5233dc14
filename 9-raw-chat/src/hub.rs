//! Broadcast fan-out.
//!
//! Sessions push [`OutgoingMessage`]s into an unbounded queue; a single
//! [`BroadcastHub`] owns the receiving end, drains it in FIFO order, and
//! writes each message to every registered peer.

use std::sync::Arc;

use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::NAME_SEPARATOR,
    registry::{PeerId, PeerRegistry},
};

/// Producer side of the broadcast queue. Cloned into every session.
pub type BroadcastQueue = mpsc::UnboundedSender<OutgoingMessage>;

/// Consumer side of the broadcast queue. Only a [`BroadcastHub`] holds it.
pub type BroadcastInbox = mpsc::UnboundedReceiver<OutgoingMessage>;

pub fn broadcast_queue() -> (BroadcastQueue, BroadcastInbox) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    sender: PeerId,
    payload: Vec<u8>,
}

impl OutgoingMessage {
    /// `name: chunk`, byte for byte. Neither part is trimmed or reframed.
    pub fn chat(sender: PeerId, name: &[u8], chunk: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(name.len() + NAME_SEPARATOR.len() + chunk.len());
        payload.extend_from_slice(name);
        payload.extend_from_slice(NAME_SEPARATOR);
        payload.extend_from_slice(chunk);
        Self { sender, payload }
    }

    /// Empty payload marking that `sender` stopped reading.
    pub fn departure(sender: PeerId) -> Self {
        Self {
            sender,
            payload: Vec::new(),
        }
    }

    pub fn sender(&self) -> PeerId {
        self.sender
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_departure(&self) -> bool {
        self.payload.is_empty()
    }
}

pub struct BroadcastHub {
    inbox: BroadcastInbox,
    registry: Arc<PeerRegistry>,
}

impl BroadcastHub {
    pub fn new(inbox: BroadcastInbox, registry: Arc<PeerRegistry>) -> Self {
        Self { inbox, registry }
    }

    /// Drains the queue until `shutdown` fires or every producer is gone.
    pub async fn pump(mut self, shutdown: CancellationToken) {
        loop {
            select! {
                _ = shutdown.cancelled() => {
                    debug!("broadcast pump cancelled");
                    break;
                }
                message = self.inbox.recv() => match message {
                    Some(message) => {
                        self.fan_out(message).await;
                    }
                    None => {
                        debug!("broadcast queue closed");
                        break;
                    }
                }
            }
        }
    }

    /// Delivers one message to every registered peer and returns how many writes succeeded.
    ///
    /// A departure writes nothing; it only unregisters its sender, which
    /// happens after everything that sender queued earlier went out.
    /// Peers whose write fails are unregistered once the pass is done.
    pub async fn fan_out(&self, message: OutgoingMessage) -> usize {
        if message.is_departure() {
            if let Some(addr) = self.registry.remove(message.sender()).await {
                info!(peer = message.sender(), %addr, "peer departed");
            }
            return 0;
        }

        let peers = self.registry.snapshot().await;
        trace!(
            sender = message.sender(),
            bytes = message.payload().len(),
            peers = peers.len(),
            "broadcasting"
        );

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, writer) in peers {
            match writer.send(message.payload()).await {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(peer = id, ?error, "failed to deliver broadcast");
                    failed.push(id);
                }
            }
        }

        for id in failed {
            if let Some(addr) = self.registry.remove(id).await {
                info!(peer = id, %addr, "dropped unreachable peer");
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use tokio::{
        io::{AsyncReadExt, DuplexStream},
        time::timeout,
    };

    use super::*;
    use crate::registry::PeerWriter;

    async fn register(registry: &PeerRegistry, port: u16) -> (PeerId, DuplexStream) {
        let (local, remote) = tokio::io::duplex(256);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let id = registry.register(addr, PeerWriter::new(local)).await;
        (id, remote)
    }

    async fn read_exactly(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(Duration::from_secs(1), stream.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        buf
    }

    #[test]
    fn chat_message_is_name_separator_payload() {
        let message = OutgoingMessage::chat(3, b"alice\n", b"hi\r\nthere");
        assert_eq!(message.payload(), b"alice\n: hi\r\nthere");
        assert!(!message.is_departure());
        assert!(OutgoingMessage::departure(3).is_departure());
    }

    #[tokio::test]
    async fn fan_out_reaches_every_peer_including_sender() {
        let registry = Arc::new(PeerRegistry::new());
        let (alice, mut alice_remote) = register(&registry, 1).await;
        let (_bob, mut bob_remote) = register(&registry, 2).await;
        let (_tx, inbox) = broadcast_queue();
        let hub = BroadcastHub::new(inbox, Arc::clone(&registry));

        let delivered = hub
            .fan_out(OutgoingMessage::chat(alice, b"alice", b"hello"))
            .await;

        assert_eq!(delivered, 2);
        assert_eq!(read_exactly(&mut alice_remote, 12).await, b"alice: hello");
        assert_eq!(read_exactly(&mut bob_remote, 12).await, b"alice: hello");
    }

    #[tokio::test]
    async fn departure_writes_nothing_and_unregisters_sender() {
        let registry = Arc::new(PeerRegistry::new());
        let (alice, mut alice_remote) = register(&registry, 1).await;
        let (bob, _bob_remote) = register(&registry, 2).await;
        let (_tx, inbox) = broadcast_queue();
        let hub = BroadcastHub::new(inbox, Arc::clone(&registry));

        assert_eq!(hub.fan_out(OutgoingMessage::departure(alice)).await, 0);

        assert!(!registry.contains(alice).await);
        assert!(registry.contains(bob).await);
        // The registry held the last writer handle, so alice's side now sees end-of-stream.
        let mut buf = Vec::new();
        alice_remote.read_to_end(&mut buf).await.expect("read");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn failed_peer_is_dropped_without_blocking_others() {
        let registry = Arc::new(PeerRegistry::new());
        let (gone, gone_remote) = register(&registry, 1).await;
        let (alive, mut alive_remote) = register(&registry, 2).await;
        drop(gone_remote);
        let (_tx, inbox) = broadcast_queue();
        let hub = BroadcastHub::new(inbox, Arc::clone(&registry));

        let delivered = hub
            .fan_out(OutgoingMessage::chat(alive, b"bob", b"still here"))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(read_exactly(&mut alive_remote, 15).await, b"bob: still here");
        assert!(!registry.contains(gone).await);
        assert!(registry.contains(alive).await);
    }

    #[tokio::test]
    async fn pump_delivers_in_queue_order_until_cancelled() {
        let registry = Arc::new(PeerRegistry::new());
        let (id, mut remote) = register(&registry, 1).await;
        let (tx, inbox) = broadcast_queue();
        let shutdown = CancellationToken::new();
        let hub = BroadcastHub::new(inbox, Arc::clone(&registry));
        let pump = tokio::spawn(hub.pump(shutdown.clone()));

        tx.send(OutgoingMessage::chat(id, b"a", b"1st")).expect("queue");
        tx.send(OutgoingMessage::chat(id, b"a", b"2nd")).expect("queue");
        tx.send(OutgoingMessage::chat(id, b"a", b"3rd")).expect("queue");

        assert_eq!(read_exactly(&mut remote, 18).await, b"a: 1sta: 2nda: 3rd");

        shutdown.cancel();
        timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump did not stop")
            .expect("pump panicked");
    }
}

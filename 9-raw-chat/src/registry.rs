use std::{
    collections::BTreeMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

pub type PeerId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to the write side of one peer's connection.
///
/// The session uses it for the greeting and the broadcast hub for fan-out;
/// the inner lock keeps those writes from interleaving mid-message.
#[derive(Clone)]
pub struct PeerWriter {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl PeerWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }
}

struct RegisteredPeer {
    addr: SocketAddr,
    writer: PeerWriter,
}

/// Set of currently connected peers, in accept order.
///
/// Every read and write of the peer set goes through the one lock held here.
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<PeerId, RegisteredPeer>>,
    next_id: AtomicU64,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a freshly accepted connection and returns its id. Ids are never reused.
    pub async fn register(&self, addr: SocketAddr, writer: PeerWriter) -> PeerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.peers.lock().await;
        peers.insert(id, RegisteredPeer { addr, writer });
        id
    }

    /// Drops the registry's handle to a peer, returning its address if it was present.
    pub async fn remove(&self, id: PeerId) -> Option<SocketAddr> {
        let mut peers = self.peers.lock().await;
        peers.remove(&id).map(|peer| peer.addr)
    }

    pub async fn contains(&self, id: PeerId) -> bool {
        self.peers.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Copies out the current writers so callers can write without holding the registry lock.
    pub async fn snapshot(&self) -> Vec<(PeerId, PeerWriter)> {
        let peers = self.peers.lock().await;
        peers
            .iter()
            .map(|(id, peer)| (*id, peer.writer.clone()))
            .collect()
    }
}

use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    hub::{BroadcastHub, BroadcastQueue, broadcast_queue},
    registry::{PeerRegistry, PeerWriter},
    session::PeerSession,
};

/// Source of already-established connections.
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

pub struct Server<L> {
    listener: L,
    registry: Arc<PeerRegistry>,
}

impl<L: Listener> Server<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            registry: Arc::new(PeerRegistry::new()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections forever.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves, then stops every session and the
    /// broadcast pump. Accept errors are logged and never end the loop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            mut listener,
            registry,
        } = self;
        let token = CancellationToken::new();
        let (queue, inbox) = broadcast_queue();
        let hub = BroadcastHub::new(inbox, Arc::clone(&registry));
        let hub = tokio::spawn(hub.pump(token.clone()));
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &queue, &token).await;
                }
            }
        }

        token.cancel();
        hub.await.context("broadcast pump panicked")?;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_accept_result<S>(
    result: io::Result<(S, SocketAddr)>,
    registry: &Arc<PeerRegistry>,
    queue: &BroadcastQueue,
    token: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match result {
        Ok((stream, addr)) => spawn_session(stream, addr, registry, queue, token).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Registers the connection before its session starts, so it receives
/// broadcasts even while its name is still unknown.
async fn spawn_session<S>(
    stream: S,
    addr: SocketAddr,
    registry: &PeerRegistry,
    queue: &BroadcastQueue,
    token: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let writer = PeerWriter::new(writer);
    let id = registry.register(addr, writer.clone()).await;
    info!(peer = id, %addr, "accepted connection");

    let session = PeerSession::new(id, reader, writer, queue.clone());
    tokio::spawn(session.run(token.clone()));
}

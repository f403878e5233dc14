//! Per-connection read side of the chat server.
//!
//! A session walks `Greeting -> Naming -> Chatting -> Closed`. It never
//! writes broadcasts itself; everything it reads goes into the broadcast
//! queue, one message per successful read.

use std::mem;

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    config::{NAME_PROMPT, READ_CHUNK_SIZE},
    hub::{BroadcastQueue, OutgoingMessage},
    registry::{PeerId, PeerWriter},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The name prompt has not been written yet.
    Greeting,
    /// Waiting on the single read that becomes the display name.
    Naming,
    /// Relaying reads to the broadcast queue under `name`.
    Chatting { name: Vec<u8> },
    Closed,
}

pub struct PeerSession<R> {
    id: PeerId,
    reader: R,
    writer: PeerWriter,
    queue: BroadcastQueue,
    state: SessionState,
    buf: Vec<u8>,
}

impl<R> PeerSession<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(id: PeerId, reader: R, writer: PeerWriter, queue: BroadcastQueue) -> Self {
        Self {
            id,
            reader,
            writer,
            queue,
            state: SessionState::Greeting,
            buf: vec![0; READ_CHUNK_SIZE],
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Performs the I/O owed by the current state and moves to the next one.
    ///
    /// If the returned future is dropped before completing, the session is left `Closed`.
    pub async fn step(&mut self) {
        let next = match mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Greeting => {
                self.greet().await;
                SessionState::Naming
            }
            SessionState::Naming => SessionState::Chatting {
                name: self.read_name().await,
            },
            SessionState::Chatting { name } => {
                if self.relay_chunk(&name).await {
                    SessionState::Chatting { name }
                } else {
                    SessionState::Closed
                }
            }
            SessionState::Closed => SessionState::Closed,
        };
        self.state = next;
    }

    /// Steps until the peer goes away or `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        while self.state != SessionState::Closed {
            select! {
                _ = shutdown.cancelled() => {
                    debug!(peer = self.id, "session cancelled");
                    break;
                }
                _ = self.step() => {}
            }
        }
        info!(peer = self.id, "session closed");
    }

    async fn greet(&mut self) {
        if let Err(error) = self.writer.send(NAME_PROMPT).await {
            debug!(peer = self.id, ?error, "failed to write name prompt");
        }
    }

    /// One raw read. Whatever arrives is the name, untrimmed, possibly empty.
    async fn read_name(&mut self) -> Vec<u8> {
        let name = match self.reader.read(&mut self.buf).await {
            Ok(n) => self.buf[..n].to_vec(),
            Err(error) => {
                debug!(peer = self.id, ?error, "failed to read name");
                Vec::new()
            }
        };
        debug!(
            peer = self.id,
            name = %String::from_utf8_lossy(&name),
            "peer named"
        );
        name
    }

    /// Returns `false` once the peer has departed.
    async fn relay_chunk(&mut self, name: &[u8]) -> bool {
        match self.reader.read(&mut self.buf).await {
            Ok(0) => {
                self.enqueue(OutgoingMessage::departure(self.id));
                false
            }
            Ok(n) => {
                trace!(peer = self.id, bytes = n, "chunk received");
                let message = OutgoingMessage::chat(self.id, name, &self.buf[..n]);
                self.enqueue(message)
            }
            Err(error) => {
                debug!(peer = self.id, ?error, "read failed, treating as departure");
                self.enqueue(OutgoingMessage::departure(self.id));
                false
            }
        }
    }

    fn enqueue(&self, message: OutgoingMessage) -> bool {
        if self.queue.send(message).is_err() {
            debug!(peer = self.id, "broadcast queue closed");
            return false;
        }
        true
    }
}

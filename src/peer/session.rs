//! The peer transport session. Owns the TCP connection and the wire codec,
//! and translates the wire protocol into [`SwarmEvent`]s the swarm
//! coordinator's event dispatcher consumes, while accepting
//! [`SessionCommand`]s describing what to send.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::codec::{Framed, FramedParts};

use super::{
    codec::{Handshake, HandshakeCodec, Message, PeerCodec},
    registry::PeerKey,
};
use crate::{error::Result, PeerId, Sha1Hash};

/// Commands the swarm coordinator issues to a peer session: send a message,
/// or shut the connection down. Requesting a block, cancelling a request,
/// and closing the connection all collapse onto these two at the transport
/// level, since they're each, fundamentally, "write this or stop".
pub(crate) enum SessionCommand {
    Send(Message),
    Shutdown,
}

pub(crate) type SessionHandle = UnboundedSender<SessionCommand>;
type CommandPort = UnboundedReceiver<SessionCommand>;

/// Events emitted by a peer session to the swarm coordinator: a completed
/// handshake, an inbound message, an I/O error, or a disconnect.
pub(crate) enum SwarmEvent {
    HandshakeComplete {
        key: PeerKey,
        addr: SocketAddr,
        peer_id: PeerId,
        session: SessionHandle,
    },
    Message {
        key: PeerKey,
        message: Message,
    },
    IoError {
        key: PeerKey,
    },
    Disconnected {
        key: PeerKey,
    },
}

pub(crate) type EventSender = UnboundedSender<SwarmEvent>;

pub(crate) struct PeerSession {
    key: PeerKey,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    client_id: PeerId,
    events: EventSender,
    /// Kept alongside `cmd_port` so the handshake-complete event can hand
    /// the coordinator a sender without fabricating a second channel.
    self_handle: SessionHandle,
    cmd_port: CommandPort,
}

impl PeerSession {
    /// Creates a new outbound session, returning it along with the command
    /// sender the swarm coordinator will use to drive it.
    pub(crate) fn outbound(
        key: PeerKey,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        client_id: PeerId,
        events: EventSender,
    ) -> (Self, SessionHandle) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let self_handle = cmd_chan.clone();
        (
            Self {
                key,
                addr,
                info_hash,
                client_id,
                events,
                self_handle,
                cmd_port,
            },
            cmd_chan,
        )
    }

    /// Connects, exchanges the handshake, and, on success, emits
    /// `HandshakeComplete` and enters the message loop. Any I/O error or
    /// handshake mismatch is reported via `IoError`/`Disconnected` rather
    /// than returned, since peer-scoped errors are never surfaced past the
    /// transport boundary.
    pub(crate) async fn start(mut self) {
        match self.run_handshake().await {
            Ok(socket) => {
                if let Err(e) = self.run(socket).await {
                    log::warn!("peer {} session ended: {}", self.addr, e);
                }
            }
            Err(e) => {
                log::info!("peer {} handshake failed: {}", self.addr, e);
            }
        }
        let _ = self.events.send(SwarmEvent::Disconnected { key: self.key });
    }

    async fn run_handshake(
        &mut self,
    ) -> Result<Framed<TcpStream, PeerCodec>> {
        let socket = TcpStream::connect(self.addr).await?;
        let mut socket = Framed::new(socket, HandshakeCodec);

        let handshake = Handshake::new(self.info_hash, self.client_id);
        socket.send(handshake).await?;

        let peer_handshake = socket
            .next()
            .await
            .ok_or(crate::error::Error::ChannelClosed)??;
        if peer_handshake.info_hash != self.info_hash {
            return Err(crate::error::Error::InvalidPeerInfoHash);
        }

        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let _ = self.events.send(SwarmEvent::HandshakeComplete {
            key: self.key,
            addr: self.addr,
            peer_id: peer_handshake.peer_id,
            session: self.self_handle.clone(),
        });

        Ok(socket)
    }

    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(message)) => {
                            let _ = self.events.send(SwarmEvent::Message {
                                key: self.key,
                                message,
                            });
                        }
                        Some(Err(e)) => {
                            log::warn!("peer {} io error: {}", self.addr, e);
                            let _ = self.events.send(SwarmEvent::IoError { key: self.key });
                            return Ok(());
                        }
                        None => return Ok(()),
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(SessionCommand::Send(message)) => {
                            if let Err(e) = sink.send(message).await {
                                log::warn!("peer {} send failed: {}", self.addr, e);
                                let _ = self.events.send(SwarmEvent::IoError { key: self.key });
                                return Ok(());
                            }
                        }
                        Some(SessionCommand::Shutdown) | None => return Ok(()),
                    }
                }
            }
        }
    }
}

/// Spawns an inbound session from an already-accepted socket, having just
/// sent our handshake in reply to the remote's.
pub(crate) fn spawn_inbound(
    key: PeerKey,
    addr: SocketAddr,
    peer_id: PeerId,
    socket: Framed<TcpStream, PeerCodec>,
    events: EventSender,
) -> SessionHandle {
    let (cmd_chan, cmd_port) = mpsc::unbounded_channel();

    let _ = events.send(SwarmEvent::HandshakeComplete {
        key,
        addr,
        peer_id,
        session: cmd_chan.clone(),
    });

    tokio::spawn(run_inbound(key, addr, socket, cmd_port, events));

    cmd_chan
}

async fn run_inbound(
    key: PeerKey,
    addr: SocketAddr,
    socket: Framed<TcpStream, PeerCodec>,
    mut cmd_port: CommandPort,
    events: EventSender,
) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(message)) => {
                        let _ = events.send(SwarmEvent::Message { key, message });
                    }
                    Some(Err(e)) => {
                        log::warn!("peer {} io error: {}", addr, e);
                        let _ = events.send(SwarmEvent::IoError { key });
                        break;
                    }
                    None => break,
                }
            }
            cmd = cmd_port.recv() => {
                match cmd {
                    Some(SessionCommand::Send(message)) => {
                        if sink.send(message).await.is_err() {
                            let _ = events.send(SwarmEvent::IoError { key });
                            break;
                        }
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                }
            }
        }
    }
    let _ = events.send(SwarmEvent::Disconnected { key });
}

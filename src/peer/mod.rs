//! The **Sharing Peer**: per-remote state shared between the network
//! session task and the swarm coordinator, plus the transport session
//! itself.

pub(crate) mod codec;
pub(crate) mod registry;
mod session;

use std::{collections::VecDeque, net::SocketAddr};

use tokio::sync::Mutex;

use crate::{
    counter::ThroughputCounter, download::DownloadingPiece, Bitfield,
    BlockInfo, PeerId,
};

pub(crate) use registry::{PeerKey, PeerRegistry};
pub(crate) use session::{
    spawn_inbound, EventSender, PeerSession, SessionCommand, SessionHandle,
    SwarmEvent,
};

/// Our and the remote's choke/interest view of a connection, plus the
/// moving parts that change together under the per-peer lock.
pub(crate) struct PeerFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    /// A freshly connected peer starts fully choked in both directions and
    /// uninterested in both directions, per the base protocol.
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Mutable per-peer state, guarded by a single per-peer lock.
pub(crate) struct PeerState {
    pub flags: PeerFlags,
    /// Set once the session's transport handle is installed; `None` means
    /// disconnected.
    pub session: Option<SessionHandle>,
    pub bitfield: Bitfield,
    /// FIFO of blocks we've asked this peer for but have not yet received.
    pub outstanding_requests: VecDeque<BlockInfo>,
    /// The piece this peer is currently helping us complete, if any. Holds
    /// the in-progress block bookkeeping itself so that if this peer chokes
    /// us mid-transfer, whatever progress was made travels with it into
    /// `PiecePicker`'s `partial_pieces` rather than being discarded.
    pub requested_piece: Option<DownloadingPiece>,
    pub dl_rate: ThroughputCounter,
    pub ul_rate: ThroughputCounter,
    /// Set after the first post-handshake message from this peer is
    /// processed. A bitfield is only legal as that very first message, so
    /// the dispatcher uses this to reject a late one.
    pub has_received_message: bool,
}

impl PeerState {
    fn new(piece_count: usize, rate_smoothing_iterations: usize) -> Self {
        let mut bitfield = Bitfield::new();
        bitfield.resize(piece_count, false);
        Self {
            flags: PeerFlags::default(),
            session: None,
            bitfield,
            outstanding_requests: VecDeque::new(),
            requested_piece: None,
            dl_rate: ThroughputCounter::new(rate_smoothing_iterations),
            ul_rate: ThroughputCounter::new(rate_smoothing_iterations),
            has_received_message: false,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn resize_bitfield(&mut self, piece_count: usize) {
        if self.bitfield.len() != piece_count {
            self.bitfield.resize(piece_count, false);
        }
    }
}

/// A registered remote peer: its identity plus its lock-guarded mutable
/// state. Reachable from the registry under both its endpoint and its
/// peer-id; referenced elsewhere (e.g. the piece table's holder sets) only
/// by its [`PeerKey`], never by an owning handle.
pub(crate) struct Peer {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub peer_id: tokio::sync::RwLock<Option<PeerId>>,
    state: Mutex<PeerState>,
}

impl Peer {
    fn new(
        key: PeerKey,
        addr: SocketAddr,
        peer_id: Option<PeerId>,
        rate_smoothing_iterations: usize,
    ) -> Self {
        Self {
            key,
            addr,
            peer_id: tokio::sync::RwLock::new(peer_id),
            // The piece count isn't known at registry time; the swarm
            // coordinator resizes the bitfield on first contact via
            // `PeerState::resize_bitfield`.
            state: Mutex::new(PeerState::new(0, rate_smoothing_iterations)),
        }
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, PeerState> {
        self.state.lock().await
    }
}

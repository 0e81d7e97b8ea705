//! The swarm coordinator: the per-torrent actor that owns the peer
//! registry, the piece table, the piece picker and the choke scheduler, and
//! drives them all from a single event loop.
//!
//! Everything below this module (the registry, the picker, the table, the
//! scheduler) is plain, lock-free-to-call data structures; this is the only
//! place that mutates more than one of them in response to a single event,
//! which is what makes it safe for them to not defend against each other.

pub(crate) mod choke;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time};
use tokio_util::codec::Framed;

use self::choke::{Candidate, ChokeScheduler};
use crate::{
    conf::SwarmConf,
    disk::{BatchWrite, DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::{Error, Result},
    peer::{
        self,
        codec::{Message, PeerCodec},
        registry::{PeerKey, PeerRegistry},
        EventSender, Peer, PeerSession, PeerState, SessionCommand, SwarmEvent,
    },
    piece_picker::PiecePicker,
    piece_table::{PieceState, PieceTable},
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// Outstanding block requests kept in flight per peer at once.
const REQUEST_QUEUE_LEN: usize = 4;

/// The coordinator's externally-visible lifecycle. Transitions are gated at
/// [`TorrentHandle`]; once `Stopping` or `Stopped`, no further command is
/// accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TorrentState {
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl TorrentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Started,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Uploaded/downloaded byte counters, updated off the hot path of any lock:
/// both directions are appended to far more often than they're read.
pub(crate) struct SharedStatus {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl SharedStatus {
    fn new() -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        }
    }

    fn add_uploaded(&self, n: u64) {
        self.uploaded.fetch_add(n, Ordering::Relaxed);
    }

    fn add_downloaded(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub(crate) fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}

/// Everything the engine needs to hand a torrent to [`Torrent::spawn`]. The
/// engine is expected to have already called
/// [`DiskHandle::allocate_new_torrent`] and waited for its
/// `Alert::TorrentAllocation` reply, since that's the `TorrentAlertReceiver`
/// this struct is built around.
pub(crate) struct TorrentParams {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage_info: StorageInfo,
    /// The concatenation of all of the torrent's expected piece hashes, 20
    /// bytes each.
    pub piece_hashes: Vec<u8>,
    pub conf: SwarmConf,
}

/// Commands accepted by a running torrent.
enum Command {
    AddPeerCandidate(SocketAddr),
    /// An inbound connection whose handshake the engine's accept loop has
    /// already completed and routed here by info hash.
    InboundHandshake {
        addr: SocketAddr,
        peer_id: PeerId,
        socket: Framed<TcpStream, PeerCodec>,
    },
    Shutdown,
}

/// A cheaply-clonable handle to a running torrent, held by the engine.
#[derive(Clone)]
pub(crate) struct TorrentHandle {
    cmd_chan: mpsc::UnboundedSender<Command>,
    pub(crate) info_hash: Sha1Hash,
    pub(crate) status: Arc<SharedStatus>,
    state: Arc<AtomicU8>,
}

impl TorrentHandle {
    pub(crate) fn add_peer_candidate(&self, addr: SocketAddr) -> Result<()> {
        self.ensure_running()?;
        Ok(self.cmd_chan.send(Command::AddPeerCandidate(addr))?)
    }

    pub(crate) fn inbound_handshake(
        &self,
        addr: SocketAddr,
        peer_id: PeerId,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        self.ensure_running()?;
        Ok(self.cmd_chan.send(Command::InboundHandshake {
            addr,
            peer_id,
            socket,
        })?)
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        self.ensure_running()?;
        self.state
            .store(TorrentState::Stopping as u8, Ordering::Release);
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }

    fn ensure_running(&self) -> Result<()> {
        match TorrentState::from_u8(self.state.load(Ordering::Acquire)) {
            TorrentState::Stopping => Err(Error::AlreadyStopped),
            TorrentState::Stopped => Err(Error::NotStarted),
            TorrentState::Starting | TorrentState::Started => Ok(()),
        }
    }
}

/// The event dispatcher itself. Lives entirely on its own task; every
/// method below runs to completion before the next event is picked up, so
/// nothing here needs to worry about another call interleaving with it.
pub(crate) struct Torrent {
    id: TorrentId,
    info_hash: Sha1Hash,
    client_id: PeerId,
    conf: SwarmConf,
    registry: PeerRegistry,
    piece_table: PieceTable,
    picker: PiecePicker,
    choke: ChokeScheduler,
    disk: DiskHandle,
    status: Arc<SharedStatus>,
    state: Arc<AtomicU8>,
    events: EventSender,
    event_port: mpsc::UnboundedReceiver<SwarmEvent>,
    cmd_port: mpsc::UnboundedReceiver<Command>,
    disk_alert_port: TorrentAlertReceiver,
}

impl Torrent {
    pub(crate) fn spawn(
        params: TorrentParams,
        disk: DiskHandle,
        disk_alert_port: TorrentAlertReceiver,
    ) -> (TorrentHandle, JoinHandle<()>) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (events, event_port) = mpsc::unbounded_channel();

        let piece_count = params.storage_info.piece_count;
        let nominal_len = params.storage_info.piece_len;
        let last_len = params.storage_info.last_piece_len;
        let piece_lens = (0..piece_count)
            .map(|i| if i + 1 == piece_count { last_len } else { nominal_len });
        let piece_hashes: Vec<Sha1Hash> = params
            .piece_hashes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let status = Arc::new(SharedStatus::new());
        let state = Arc::new(AtomicU8::new(TorrentState::Started as u8));

        let torrent = Self {
            id: params.id,
            info_hash: params.info_hash,
            client_id: params.client_id,
            registry: PeerRegistry::new(),
            piece_table: PieceTable::new(piece_lens, &piece_hashes),
            picker: PiecePicker::new(piece_count),
            choke: ChokeScheduler::new(
                params.conf.optimistic_iterations,
                params.conf.max_downloaders_unchoke,
            ),
            conf: params.conf,
            disk,
            status: Arc::clone(&status),
            state: Arc::clone(&state),
            events,
            event_port,
            cmd_port,
            disk_alert_port,
        };

        let handle = TorrentHandle {
            cmd_chan,
            info_hash: torrent.info_hash,
            status,
            state,
        };

        let join_handle = tokio::task::spawn(torrent.run());

        (handle, join_handle)
    }

    async fn run(mut self) {
        let mut ticker = time::interval(self.conf.unchoke_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
                event = self.event_port.recv() => {
                    match event {
                        Some(event) => self.on_swarm_event(event).await,
                        None => break,
                    }
                }
                alert = self.disk_alert_port.recv() => {
                    match alert {
                        Some(alert) => self.on_disk_alert(alert).await,
                        None => break,
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.on_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        self.state
            .store(TorrentState::Stopped as u8, Ordering::Release);
        log::info!("torrent {} stopped", self.id);
    }

    /// Returns `true` if the caller should stop the event loop.
    async fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::AddPeerCandidate(addr) => {
                self.on_add_peer_candidate(addr).await;
                false
            }
            Command::InboundHandshake { addr, peer_id, socket } => {
                let peer = self
                    .registry
                    .get_or_create(
                        addr,
                        Some(peer_id),
                        self.conf.rate_computation_iterations,
                    )
                    .await;
                peer::spawn_inbound(peer.key, addr, peer_id, socket, self.events.clone());
                false
            }
            Command::Shutdown => {
                for peer in self.registry.connected_peers().await {
                    self.close_peer(&peer).await;
                }
                true
            }
        }
    }

    async fn on_add_peer_candidate(&mut self, addr: SocketAddr) {
        if self.registry.contains_addr(&addr).await {
            return;
        }
        let peer = self
            .registry
            .get_or_create(addr, None, self.conf.rate_computation_iterations)
            .await;
        let (session, _handle) = PeerSession::outbound(
            peer.key,
            addr,
            self.info_hash,
            self.client_id,
            self.events.clone(),
        );
        // The returned handle isn't installed into `PeerState` here: the
        // session only becomes usable once its handshake completes, and
        // `on_handshake_complete` installs the identical handle it carries
        // along with that event. Installing it early would let a caller
        // send on a connection that hasn't finished the handshake yet.
        tokio::task::spawn(session.start());
    }

    async fn on_swarm_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::HandshakeComplete { key, addr, peer_id, session } => {
                self.on_handshake_complete(key, addr, peer_id, session).await;
            }
            SwarmEvent::Message { key, message } => {
                self.on_message(key, message).await;
            }
            SwarmEvent::IoError { key } => {
                self.on_io_error(key).await;
            }
            SwarmEvent::Disconnected { key } => {
                self.on_disconnect(key).await;
            }
        }
    }

    async fn on_handshake_complete(
        &mut self,
        key: PeerKey,
        addr: SocketAddr,
        peer_id: PeerId,
        session: peer::SessionHandle,
    ) {
        self.registry.bind_peer_id(key, peer_id).await;
        let peer = match self.registry.get(key).await {
            Some(peer) => peer,
            None => return,
        };

        {
            let mut state = peer.lock().await;
            if state.is_connected() {
                // A handshake already completed for this peer (the dual-key
                // registry resolved an inbound and an outbound attempt to
                // the same record); keep the existing session and shut the
                // new one down rather than swapping the live connection out
                // from under any in-flight requests.
                let _ = session.send(SessionCommand::Shutdown);
                return;
            }
            state.session = Some(session.clone());
            state.resize_bitfield(self.piece_table.len());
        }
        log::info!("torrent {} completed handshake with {}", self.id, addr);

        if self.piece_table.completed_count() > 0 {
            let _ = session.send(SessionCommand::Send(Message::Bitfield(
                self.local_bitfield(),
            )));
        }
    }

    fn local_bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new();
        for i in 0..self.piece_table.len() {
            bitfield.push(self.piece_table.get(i).is_completed());
        }
        bitfield
    }

    async fn on_message(&mut self, key: PeerKey, message: Message) {
        let peer = match self.registry.get(key).await {
            Some(peer) => peer,
            None => return,
        };

        if let Message::Bitfield(_) = &message {
            if peer.lock().await.has_received_message {
                log::warn!(
                    "torrent {} peer {} sent a bitfield outside the handshake phase",
                    self.id,
                    peer.addr
                );
                self.close_peer(&peer).await;
                return;
            }
        }

        match message {
            Message::KeepAlive => {}
            Message::Choke => self.on_peer_choke(&peer).await,
            Message::Unchoke => self.on_peer_unchoke(&peer).await,
            Message::Interested => {
                peer.lock().await.flags.peer_interested = true;
            }
            Message::NotInterested => self.on_peer_not_interested(&peer).await,
            Message::Have { piece_index } => self.on_have(&peer, piece_index).await,
            Message::Bitfield(bitfield) => self.on_bitfield(&peer, bitfield).await,
            Message::Request(block) => self.on_request(&peer, block).await,
            Message::Block { piece_index, offset, data } => {
                self.on_block(&peer, piece_index, offset, data).await;
            }
            Message::Cancel(_) => {
                // Uploads are served eagerly as soon as the disk read
                // completes, so there's nothing queued to cancel.
            }
        }

        peer.lock().await.has_received_message = true;
    }

    async fn on_peer_choke(&mut self, peer: &Peer) {
        let orphaned = {
            let mut state = peer.lock().await;
            state.flags.peer_choking = true;
            state.outstanding_requests.clear();
            state.requested_piece.take()
        };
        if let Some(download) = orphaned {
            self.picker.orphan(download);
        }
    }

    async fn on_peer_unchoke(&mut self, peer: &Peer) {
        let mut state = peer.lock().await;
        state.flags.peer_choking = false;
        self.assign_piece(&mut state).await;
    }

    async fn on_peer_not_interested(&mut self, peer: &Peer) {
        let mut state = peer.lock().await;
        state.flags.peer_interested = false;
        if !state.flags.am_choking {
            state.flags.am_choking = true;
            if let Some(session) = &state.session {
                let _ = session.send(SessionCommand::Send(Message::Choke));
            }
        }
    }

    async fn on_have(&mut self, peer: &Peer, piece_index: PieceIndex) {
        if piece_index >= self.piece_table.len() {
            log::warn!(
                "torrent {} peer {} sent have() for out-of-range piece {}",
                self.id,
                peer.addr,
                piece_index
            );
            self.close_peer(peer).await;
            return;
        }

        self.piece_table.add_holder(piece_index, peer.key);

        let mut state = peer.lock().await;
        state.bitfield.set(piece_index, true);
        self.update_interest(&mut state).await;
        self.assign_piece(&mut state).await;
    }

    async fn on_bitfield(&mut self, peer: &Peer, bitfield: Bitfield) {
        let mut state = peer.lock().await;
        let len = self.piece_table.len().min(bitfield.len());
        for i in 0..len {
            if bitfield[i] {
                self.piece_table.add_holder(i, peer.key);
                state.bitfield.set(i, true);
            }
        }
        self.update_interest(&mut state).await;
        self.assign_piece(&mut state).await;
    }

    /// Sets `am_interested` (and sends it) if the peer now advertises any
    /// piece we don't have yet, having just processed a `have` or
    /// `bitfield`.
    async fn update_interest(&self, state: &mut PeerState) {
        if state.flags.am_interested {
            return;
        }
        let interesting = (0..self.piece_table.len())
            .any(|i| state.bitfield[i] && !self.piece_table.get(i).is_completed());
        if interesting {
            state.flags.am_interested = true;
            if let Some(session) = &state.session {
                let _ = session.send(SessionCommand::Send(Message::Interested));
            }
        }
    }

    /// Picks a piece for `state`'s peer and requests its first batch of
    /// blocks, if it's unchoking us and not already pursuing something.
    async fn assign_piece(&mut self, state: &mut PeerState) {
        if state.flags.peer_choking || state.requested_piece.is_some() {
            return;
        }
        let mut download = match self.picker.next_piece_for(
            &state.bitfield,
            &self.piece_table,
            self.conf.end_game_completion_ratio,
        ) {
            Some(download) => download,
            None => return,
        };

        if self.piece_table.get(download.piece_index()).state == PieceState::Missing {
            self.piece_table
                .set_state(download.piece_index(), PieceState::Requested);
        }

        let mut blocks = Vec::new();
        download.pick_blocks(REQUEST_QUEUE_LEN, &mut blocks);
        if let Some(session) = &state.session {
            for block in &blocks {
                state.outstanding_requests.push_back(*block);
                let _ = session.send(SessionCommand::Send(Message::Request(*block)));
            }
        }
        state.requested_piece = Some(download);
    }

    async fn on_request(&mut self, peer: &Peer, block: BlockInfo) {
        let (am_choking, session) = {
            let state = peer.lock().await;
            (state.flags.am_choking, state.session.clone())
        };
        if am_choking {
            log::warn!(
                "torrent {} peer {} requested a block while choked",
                self.id,
                peer.addr
            );
            self.close_peer(peer).await;
            return;
        }
        let session = match session {
            Some(session) => session,
            None => return,
        };

        match self.disk.read_block(self.id, block) {
            Ok(rx) => {
                // The read is awaited off the dispatcher's own task so a
                // slow disk can't stall every other peer's events.
                let status = Arc::clone(&self.status);
                tokio::task::spawn(async move {
                    if let Ok(Ok(data)) = rx.await {
                        let len = data.len() as u64;
                        let sent = session.send(SessionCommand::Send(Message::Block {
                            piece_index: block.piece_index,
                            offset: block.offset,
                            data,
                        }));
                        if sent.is_ok() {
                            status.add_uploaded(len);
                        }
                    }
                });
            }
            Err(e) => {
                log::warn!("torrent {} failed to queue block read: {}", self.id, e);
            }
        }
    }

    async fn on_block(
        &mut self,
        peer: &Peer,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) {
        let block = BlockInfo { piece_index, offset, len: data.len() as u32 };
        let len = block.len;

        let mut state = peer.lock().await;
        match state.outstanding_requests.iter().position(|b| *b == block) {
            Some(pos) => {
                state.outstanding_requests.remove(pos);
            }
            None => {
                // A block we never requested is a protocol violation, not
                // something to silently accept: drop the connection rather
                // than crediting `downloaded` or writing unsolicited data to
                // disk.
                log::warn!(
                    "torrent {} received an unrequested block from {}, closing",
                    self.id,
                    peer.addr
                );
                drop(state);
                self.close_peer(peer).await;
                return;
            }
        }

        state.dl_rate.update(len);
        self.status.add_downloaded(u64::from(len));

        if let Err(e) = self.disk.write_block(self.id, block, data) {
            log::warn!("torrent {} failed to queue block write: {}", self.id, e);
        }

        let mut piece_done = false;
        if let Some(download) = state.requested_piece.as_mut() {
            if download.piece_index() == piece_index {
                download.received_block(block);
                if self.piece_table.get(piece_index).state == PieceState::Requested {
                    self.piece_table.set_state(piece_index, PieceState::Downloading);
                }
                piece_done = download.is_complete();
            }
        }

        if piece_done {
            // The piece store still has to hash and write this piece; it's
            // `on_batch_write` that actually marks it completed once that
            // comes back, so the picker keeps treating it as outstanding
            // until then.
            state.requested_piece = None;
            self.assign_piece(&mut state).await;
        } else {
            let mut more = Vec::new();
            if let Some(download) = state.requested_piece.as_mut() {
                download.pick_blocks(1, &mut more);
            }
            if let Some(session) = &state.session {
                for block in &more {
                    state.outstanding_requests.push_back(*block);
                    let _ = session.send(SessionCommand::Send(Message::Request(*block)));
                }
            }
        }
    }

    async fn on_io_error(&mut self, key: PeerKey) {
        if let Some(peer) = self.registry.get(key).await {
            log::debug!("torrent {} io error with peer {}", self.id, peer.addr);
        }
    }

    async fn on_disconnect(&mut self, key: PeerKey) {
        let peer = match self.registry.get(key).await {
            Some(peer) => peer,
            None => return,
        };

        let orphaned = {
            let mut state = peer.lock().await;
            state.session = None;
            state.requested_piece.take()
        };
        if let Some(download) = orphaned {
            self.picker.orphan(download);
        }
        self.piece_table.remove_holder_everywhere(&key);
        self.registry.remove(&peer).await;
        log::info!("torrent {} peer {} disconnected", self.id, peer.addr);
    }

    async fn on_tick(&mut self) {
        let peers = self.registry.connected_peers().await;
        let sharing = self.piece_table.is_complete();

        let mut candidates = Vec::new();
        for peer in &peers {
            let mut state = peer.lock().await;
            let dl_rate = state.dl_rate.tick();
            let ul_rate = state.ul_rate.tick();
            if state.flags.peer_interested {
                let rate = if sharing { ul_rate } else { dl_rate };
                candidates.push(Candidate { key: peer.key, rate });
            }
        }

        let decision = self.choke.tick(candidates);

        for peer in &peers {
            let mut state = peer.lock().await;
            let should_unchoke = decision.unchoke.contains(&peer.key);
            if should_unchoke && state.flags.am_choking {
                state.flags.am_choking = false;
                if let Some(session) = &state.session {
                    let _ = session.send(SessionCommand::Send(Message::Unchoke));
                }
            } else if !should_unchoke
                && state.flags.peer_interested
                && !state.flags.am_choking
            {
                state.flags.am_choking = true;
                if let Some(session) = &state.session {
                    let _ = session.send(SessionCommand::Send(Message::Choke));
                }
            }
        }
    }

    async fn on_disk_alert(&mut self, alert: TorrentAlert) {
        match alert {
            TorrentAlert::BatchWrite(Ok(batch)) => self.on_batch_write(batch).await,
            TorrentAlert::BatchWrite(Err(e)) => {
                log::error!("torrent {} disk write failed: {}", self.id, e);
            }
        }
    }

    async fn on_batch_write(&mut self, batch: BatchWrite) {
        let index = batch.piece_index;
        if batch.is_piece_valid {
            if self.piece_table.mark_completed(index) {
                self.picker.clear_requested(index);
                self.broadcast_have(index).await;
                if self.piece_table.is_complete() {
                    log::info!("torrent {} finished downloading", self.id);
                    self.cancel_all_requests().await;
                }
            }
        } else {
            log::warn!(
                "torrent {} piece {} failed its hash check, will be re-requested",
                self.id,
                index
            );
            self.piece_table.mark_invalid(index);
            self.picker.clear_requested(index);
        }
    }

    async fn broadcast_have(&self, index: PieceIndex) {
        for peer in self.registry.connected_peers().await {
            let state = peer.lock().await;
            if let Some(session) = &state.session {
                let _ = session.send(SessionCommand::Send(Message::Have { piece_index: index }));
            }
        }
    }

    /// Cancels every outstanding block request on every connected peer, once
    /// the torrent has finished: best-effort, since any block that was
    /// already in flight is simply a redundant write once it arrives.
    async fn cancel_all_requests(&self) {
        for peer in self.registry.connected_peers().await {
            let mut state = peer.lock().await;
            let requests: Vec<BlockInfo> = state.outstanding_requests.drain(..).collect();
            state.requested_piece = None;
            if let Some(session) = &state.session {
                for block in requests {
                    let _ = session.send(SessionCommand::Send(Message::Cancel(block)));
                }
            }
        }
    }

    async fn close_peer(&self, peer: &Peer) {
        let state = peer.lock().await;
        if let Some(session) = &state.session {
            let _ = session.send(SessionCommand::Shutdown);
        }
    }
}

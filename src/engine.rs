//! The multi-torrent **Engine**: owns the disk task, the listening socket,
//! and the set of running torrents, routing each inbound connection to the
//! torrent whose info hash it announces.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::Conf,
    disk::{Alert, AlertReceiver, DiskHandle},
    error::{Error, Result},
    metainfo::Metainfo,
    peer::codec::{Handshake, HandshakeCodec, PeerCodec},
    storage_info::StorageInfo,
    swarm::{Torrent, TorrentHandle, TorrentParams},
    tracker::{Announce, Event as AnnounceEvent, Tracker},
    PeerId, Sha1Hash, TorrentId,
};

/// How long the announce loop waits before retrying while the torrent it's
/// announcing for hasn't finished its disk allocation yet.
const AWAIT_ALLOCATION_RETRY: Duration = Duration::from_millis(500);
/// Backoff applied after a failed announce, independent of the tracker's own
/// `interval`, which we don't have yet if the very first announce fails.
const ANNOUNCE_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Commands sent to the engine's own event loop.
enum Command {
    NewConnection(TcpStream, SocketAddr),
    Shutdown,
}

/// Params parked between `DiskHandle::allocate_new_torrent` and the disk
/// task's matching `Alert::TorrentAllocation`, which is what actually lets
/// `Torrent::spawn` run (it needs the per-torrent alert port the allocation
/// carries).
struct PendingTorrent {
    params: TorrentParams,
    info_hash: Sha1Hash,
}

type TorrentMap = Arc<RwLock<HashMap<Sha1Hash, TorrentHandle>>>;
type PendingMap = Arc<RwLock<HashMap<TorrentId, PendingTorrent>>>;

/// A running torrent engine: the listening socket's accept loop, the disk
/// task, and every currently running torrent, all driven from one task.
pub struct Engine {
    cmd_chan: mpsc::UnboundedSender<Command>,
    torrents: TorrentMap,
    pending: PendingMap,
    disk: DiskHandle,
    conf: Conf,
    listen_port: u16,
    stopping: Arc<AtomicBool>,
    _join_handle: JoinHandle<()>,
}

impl Engine {
    /// Spawns the engine: the disk task, a listener bound to `listen_addr`,
    /// and the accept loop that routes inbound connections by info hash.
    pub fn new(conf: Conf, listen_addr: SocketAddr) -> Result<Self> {
        let (disk, disk_alert_port, _disk_join_handle) = DiskHandle::spawn()?;
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let torrents: TorrentMap = Arc::new(RwLock::new(HashMap::new()));
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let stopping = Arc::new(AtomicBool::new(false));
        let listen_port = listen_addr.port();

        let accept_cmd_chan = cmd_chan.clone();
        tokio::task::spawn(async move {
            let listener = match TcpListener::bind(listen_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    log::error!("failed to bind {}: {}", listen_addr, e);
                    return;
                }
            };
            log::info!("listening on {}", listen_addr);
            loop {
                match listener.accept().await {
                    Ok((socket, addr)) => {
                        let _ = accept_cmd_chan
                            .send(Command::NewConnection(socket, addr));
                    }
                    Err(e) => {
                        log::warn!("accept error: {}", e);
                    }
                }
            }
        });

        let join_handle = tokio::task::spawn(Self::run(
            cmd_port,
            disk_alert_port,
            Arc::clone(&torrents),
            Arc::clone(&pending),
            disk.clone(),
            conf.engine.client_id,
        ));

        Ok(Self {
            cmd_chan,
            torrents,
            pending,
            disk,
            conf,
            listen_port,
            stopping,
            _join_handle: join_handle,
        })
    }

    async fn run(
        mut cmd_port: mpsc::UnboundedReceiver<Command>,
        mut disk_alert_port: AlertReceiver,
        torrents: TorrentMap,
        pending: PendingMap,
        disk: DiskHandle,
        client_id: PeerId,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_port.recv() => {
                    match cmd {
                        Some(Command::NewConnection(socket, addr)) => {
                            let torrents = Arc::clone(&torrents);
                            tokio::task::spawn(async move {
                                route_inbound(socket, addr, torrents, client_id).await;
                            });
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                alert = disk_alert_port.recv() => {
                    match alert {
                        Some(Alert::TorrentAllocation(Ok(allocation))) => {
                            let entry = pending.write().await.remove(&allocation.id);
                            if let Some(entry) = entry {
                                let (handle, _join_handle) = Torrent::spawn(
                                    entry.params,
                                    disk.clone(),
                                    allocation.alert_port,
                                );
                                torrents.write().await.insert(entry.info_hash, handle);
                                log::info!("torrent {} started", allocation.id);
                            } else {
                                log::warn!(
                                    "torrent allocation {} has no pending entry",
                                    allocation.id
                                );
                            }
                        }
                        Some(Alert::TorrentAllocation(Err(e))) => {
                            log::error!("torrent allocation failed: {}", e);
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Parses a `.torrent` file's contents and begins seeding/leeching it.
    ///
    /// Returns the newly assigned torrent id immediately; the torrent isn't
    /// actually running until the disk task has allocated its on-disk
    /// layout and the engine's event loop has picked up the resulting
    /// `Alert::TorrentAllocation`, both of which happen asynchronously on
    /// the engine's own task.
    pub async fn create_torrent(
        &self,
        metainfo_bytes: &[u8],
        download_dir: Option<PathBuf>,
    ) -> Result<TorrentId> {
        let metainfo = Metainfo::from_bytes(metainfo_bytes).map_err(Error::Bencode)?;
        let info_hash = metainfo.create_info_hash().map_err(Error::Bencode)?;
        let download_dir =
            download_dir.unwrap_or_else(|| self.conf.torrent.download_dir.clone());
        let storage_info = StorageInfo::new(&metainfo, download_dir);
        let download_len = storage_info.download_len;

        let id: TorrentId = rand::thread_rng().gen();

        self.pending.write().await.insert(
            id,
            PendingTorrent {
                params: TorrentParams {
                    id,
                    info_hash,
                    client_id: self.conf.engine.client_id,
                    storage_info: storage_info.clone(),
                    piece_hashes: metainfo.piece_hashes.clone(),
                    conf: self.conf.swarm,
                },
                info_hash,
            },
        );

        self.disk
            .allocate_new_torrent(id, storage_info, metainfo.piece_hashes)?;

        if let Some(announce_url) = metainfo.announce {
            tokio::task::spawn(announce_loop(
                announce_url,
                info_hash,
                self.conf.engine.client_id,
                self.listen_port,
                download_len,
                self.conf.torrent.tracker_error_threshold,
                Arc::clone(&self.torrents),
                Arc::clone(&self.stopping),
            ));
        } else {
            log::debug!("torrent {} has no announce URL, skipping tracker", id);
        }

        Ok(id)
    }

    /// Hands a candidate peer address to a running torrent, e.g. one learned
    /// from a tracker announce or a DHT lookup.
    pub async fn add_peer(&self, info_hash: Sha1Hash, addr: SocketAddr) -> Result<()> {
        let torrents = self.torrents.read().await;
        let handle = torrents.get(&info_hash).ok_or(Error::InvalidTorrentId)?;
        handle.add_peer_candidate(addr)
    }

    pub async fn shutdown(self) -> Result<()> {
        self.stopping.store(true, Ordering::Release);
        let torrents = self.torrents.read().await;
        for handle in torrents.values() {
            let _ = handle.shutdown();
        }
        drop(torrents);
        let _ = self.cmd_chan.send(Command::Shutdown);
        self.disk.shutdown()
    }
}

/// Reads the inbound handshake, looks up the torrent it names, replies with
/// our own handshake, and hands the connection off to that torrent's
/// coordinator for the rest of its life.
async fn route_inbound(
    socket: TcpStream,
    addr: SocketAddr,
    torrents: TorrentMap,
    client_id: PeerId,
) {
    use futures::{SinkExt, StreamExt};

    let mut framed = Framed::new(socket, HandshakeCodec);
    let handshake = match framed.next().await {
        Some(Ok(handshake)) => handshake,
        _ => {
            log::debug!("peer {} dropped before completing handshake", addr);
            return;
        }
    };

    let handle = {
        let torrents = torrents.read().await;
        match torrents.get(&handshake.info_hash) {
            Some(handle) => handle.clone(),
            None => {
                log::debug!("peer {} announced an unknown info hash", addr);
                return;
            }
        }
    };

    let reply = Handshake::new(handshake.info_hash, client_id);
    if framed.send(reply).await.is_err() {
        return;
    }

    let old_parts = framed.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let socket = Framed::from_parts(new_parts);

    if let Err(e) = handle.inbound_handshake(addr, handshake.peer_id, socket) {
        log::warn!("failed to hand off inbound peer {}: {}", addr, e);
    }
}

/// Periodically announces to a torrent's tracker and feeds back whatever
/// peers it returns, until the engine is shut down or the tracker keeps
/// failing past `error_threshold` in a row.
///
/// Announcing starts as soon as this is spawned, which may be before the
/// disk task has finished allocating the torrent's layout (and so before
/// its [`TorrentHandle`] is registered); in that case the loop just waits
/// and retries rather than announcing `0` downloaded / `download_len` left
/// against a torrent that isn't running yet.
async fn announce_loop(
    announce_url: String,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    download_len: u64,
    error_threshold: usize,
    torrents: TorrentMap,
    stopping: Arc<AtomicBool>,
) {
    let tracker = Tracker::new(announce_url);
    let mut event = Some(AnnounceEvent::Started);
    let mut error_count = 0;

    while !stopping.load(Ordering::Acquire) {
        let handle = {
            let torrents = torrents.read().await;
            torrents.get(&info_hash).cloned()
        };
        let handle = match handle {
            Some(handle) => handle,
            None => {
                tokio::time::delay_for(AWAIT_ALLOCATION_RETRY).await;
                continue;
            }
        };

        let downloaded = handle.status.downloaded();
        let uploaded = handle.status.uploaded();
        let left = download_len.saturating_sub(downloaded);

        let params = Announce {
            info_hash,
            peer_id,
            port,
            uploaded,
            downloaded,
            left,
            event: event.take(),
        };

        match tracker.announce(params).await {
            Ok(response) => {
                error_count = 0;
                for addr in response.peers {
                    let _ = handle.add_peer_candidate(addr);
                }
                let wait = response.min_interval.unwrap_or(response.interval);
                tokio::time::delay_for(wait).await;
            }
            Err(e) => {
                error_count += 1;
                log::warn!(
                    "announce to tracker for torrent {:x?} failed ({}/{}): {}",
                    &info_hash[..4],
                    error_count,
                    error_threshold,
                    e
                );
                if error_count >= error_threshold {
                    log::error!(
                        "tracker error threshold reached for torrent {:x?}, giving up",
                        &info_hash[..4]
                    );
                    return;
                }
                tokio::time::delay_for(ANNOUNCE_ERROR_BACKOFF).await;
            }
        }
    }

    // Best-effort: let the tracker know we're leaving so it can drop us from
    // its peer list before our entry times out on its own.
    let params = Announce {
        info_hash,
        peer_id,
        port,
        uploaded: 0,
        downloaded: 0,
        left: download_len,
        event: Some(AnnounceEvent::Stopped),
    };
    let _ = tracker.announce(params).await;
}

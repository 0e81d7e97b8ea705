//! The disk IO task: piece storage, hashing, and validation, kept out of
//! the swarm coordinator's core and run as its own actor, built the same
//! way the rest of the engine is: an actor owning an unbounded mpsc command
//! channel, run on its own task.

mod io;

use std::collections::HashMap;

use tokio::{
    sync::mpsc,
    task::{self, JoinHandle},
};

use crate::{
    error::{NewTorrentError, ReadError, Result, WriteError},
    storage_info::StorageInfo,
    BlockInfo, PieceIndex, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// Commands sent to the disk task.
pub(crate) enum Command {
    /// Registers a new torrent, allocating its on-disk file layout.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        /// The concatenation of all of the torrent's expected piece hashes.
        piece_hashes: Vec<u8>,
    },
    /// Queues a downloaded block for writing.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block back off disk to serve an upload request. The result is
    /// delivered on `tx` rather than as a `TorrentAlert`, since unlike
    /// writes, a read has exactly one waiting consumer (the peer session
    /// that asked for the block) rather than the torrent's whole alert
    /// stream.
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        tx: tokio::sync::oneshot::Sender<std::result::Result<Vec<u8>, ReadError>>,
    },
    Shutdown,
}

/// Alerts sent from the disk task to the engine.
pub(crate) enum Alert {
    TorrentAllocation(
        std::result::Result<TorrentAllocation, NewTorrentError>,
    ),
}

pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

/// Alerts sent from the disk task to a specific torrent.
pub(crate) enum TorrentAlert {
    BatchWrite(std::result::Result<BatchWrite, WriteError>),
}

/// The result of a completed batch of block writes (i.e. a completed piece).
///
/// Only sent once a piece's write buffer has all its blocks and has been
/// hashed, never for a partial write, so `piece_index` is always present
/// even when the piece turned out to be invalid (in which case `blocks` is
/// empty, since none of it was written to disk).
pub(crate) struct BatchWrite {
    pub piece_index: PieceIndex,
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: bool,
}

/// A handle to the disk task, used by the engine and by torrents to queue
/// work without waiting on it.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk task and returns a handle to it plus the alert
    /// channel on which the engine is notified of torrent allocation
    /// results.
    pub(crate) fn spawn() -> Result<(Self, AlertReceiver, JoinHandle<Result<()>>)> {
        let (mut disk, cmd_chan, alert_port) = io::Disk::new()?;
        let join_handle = task::spawn(async move { disk.start().await });
        Ok((Self { cmd_chan }, alert_port, join_handle))
    }

    pub(crate) fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
        })?)
    }

    pub(crate) fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::WriteBlock { id, info, data })?)
    }

    /// Queues a block read for an upload request, returning a future that
    /// resolves once the disk task has served it (or failed to).
    pub(crate) fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
    ) -> Result<tokio::sync::oneshot::Receiver<std::result::Result<Vec<u8>, ReadError>>>
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.cmd_chan.send(Command::ReadBlock { id, info, tx })?;
        Ok(rx)
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }
}


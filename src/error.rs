//! The crate-wide error type.
//!
//! Only variants that amount to a **coordinator misuse** (an operation
//! invoked before `start` or after `stop`) are ever surfaced to a caller.
//! Everything peer-scoped is absorbed at the point of occurrence and
//! converted into a disconnect, per the error handling design: a malformed
//! message or a failed read is that peer's problem, not the swarm's.

use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("peer sent a different info hash than expected")]
    InvalidPeerInfoHash,

    #[error("peer claims to be a seed but its bitfield says otherwise")]
    PeerNotSeed,

    #[error("peer sent a bitfield after the handshake phase")]
    BitfieldNotAfterHandshake,

    #[error("peer sent an unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("piece index is invalid for this torrent")]
    InvalidPieceIndex,

    #[error("torrent id is not registered with the engine")]
    InvalidTorrentId,

    #[error("channel closed unexpectedly")]
    ChannelClosed,

    #[error("coordinator operation invoked before start")]
    NotStarted,

    #[error("coordinator operation invoked after stop")]
    AlreadyStopped,

    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker request failed: {0}")]
    Tracker(#[from] reqwest::Error),

    #[error("tracker sent a malformed response: {0}")]
    InvalidTrackerResponse(&'static str),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}

/// Errors that can occur while allocating a new torrent's on-disk layout.
#[derive(Debug, thiserror::Error)]
pub enum NewTorrentError {
    #[error("torrent already exists")]
    AlreadyExists,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that can occur while writing a block to disk.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("piece index is invalid for this torrent")]
    InvalidPieceIndex,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that can occur while reading a block back off disk to serve an
/// upload request.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("piece index is invalid for this torrent")]
    InvalidPieceIndex,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

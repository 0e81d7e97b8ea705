//! The piece table: per-torrent, index-aligned piece bookkeeping.
//!
//! Tracks each piece's completion state, its swarm-wide availability, and
//! the (non-owning) set of connected peers known to hold it. This is the
//! leaf-most component of the swarm coordinator: nothing here depends on
//! the peer registry, the selector, or the scheduler.

use std::collections::HashSet;

use crate::{peer::registry::PeerKey, PieceIndex, Sha1Hash};

/// A piece's lifecycle state.
///
/// Only `Missing -> Requested`, `Requested -> Downloading`, and
/// `Downloading -> {Completed, ValidatedBad}` transitions are legal;
/// `Completed` is terminal. `ValidatedBad` pieces revert to `Missing` so
/// another peer may redeliver them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PieceState {
    Missing,
    Requested,
    Downloading,
    Completed,
}

#[derive(Clone, Debug)]
pub(crate) struct Piece {
    pub index: PieceIndex,
    pub len: u32,
    pub expected_hash: Sha1Hash,
    pub state: PieceState,
    /// Connected peers known to advertise this piece, identified by their
    /// registry key rather than an owning handle: pieces never keep a peer
    /// record alive.
    holders: HashSet<PeerKey>,
}

impl Piece {
    fn new(index: PieceIndex, len: u32, expected_hash: Sha1Hash) -> Self {
        Self {
            index,
            len,
            expected_hash,
            state: PieceState::Missing,
            holders: HashSet::new(),
        }
    }

    /// The number of connected peers advertising this piece. Always equal
    /// to `|holders|`.
    pub(crate) fn availability(&self) -> usize {
        self.holders.len()
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state == PieceState::Completed
    }
}

/// The full set of pieces in a torrent, indexed by piece index.
pub(crate) struct PieceTable {
    pieces: Vec<Piece>,
    completed_count: usize,
}

impl PieceTable {
    pub(crate) fn new(lens: impl IntoIterator<Item = u32>, hashes: &[Sha1Hash]) -> Self {
        let pieces = lens
            .into_iter()
            .enumerate()
            .map(|(i, len)| Piece::new(i, len, hashes[i]))
            .collect();
        Self {
            pieces,
            completed_count: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pieces.len()
    }

    pub(crate) fn get(&self, index: PieceIndex) -> &Piece {
        &self.pieces[index]
    }

    pub(crate) fn completed_count(&self) -> usize {
        self.completed_count
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.completed_count == self.pieces.len()
    }

    /// Adds `peer` to `index`'s holder set, incrementing availability.
    /// Idempotent: adding the same peer twice has the same effect as once.
    pub(crate) fn add_holder(&mut self, index: PieceIndex, peer: PeerKey) {
        self.pieces[index].holders.insert(peer);
    }

    /// Removes `peer` from `index`'s holder set, decrementing availability.
    pub(crate) fn remove_holder(&mut self, index: PieceIndex, peer: &PeerKey) {
        self.pieces[index].holders.remove(peer);
    }

    /// Removes `peer` from every piece's holder set. Used on disconnect, so
    /// that availability is corrected before the piece selector can next
    /// observe this peer.
    pub(crate) fn remove_holder_everywhere(&mut self, peer: &PeerKey) {
        for piece in &mut self.pieces {
            piece.holders.remove(peer);
        }
    }

    /// Marks a piece completed and valid. Returns `false` if it was already
    /// completed (never double-counts, invariant "no completed piece is ever
    /// re-requested").
    pub(crate) fn mark_completed(&mut self, index: PieceIndex) -> bool {
        let piece = &mut self.pieces[index];
        if piece.state == PieceState::Completed {
            return false;
        }
        piece.state = PieceState::Completed;
        self.completed_count += 1;
        true
    }

    /// Reverts an invalid piece back to `Missing` so it may be redelivered.
    pub(crate) fn mark_invalid(&mut self, index: PieceIndex) {
        let piece = &mut self.pieces[index];
        debug_assert_ne!(piece.state, PieceState::Completed);
        piece.state = PieceState::Missing;
    }

    pub(crate) fn set_state(&mut self, index: PieceIndex, state: PieceState) {
        debug_assert_ne!(self.pieces[index].state, PieceState::Completed);
        self.pieces[index].state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(key: u64) -> PeerKey {
        PeerKey(key)
    }

    fn table(n: usize) -> PieceTable {
        PieceTable::new(std::iter::repeat(1 << 14).take(n), &vec![[0u8; 20]; n])
    }

    #[test]
    fn availability_tracks_holders() {
        let mut t = table(4);
        t.add_holder(0, addr(1));
        t.add_holder(0, addr(2));
        assert_eq!(t.get(0).availability(), 2);
        t.remove_holder(0, &addr(1));
        assert_eq!(t.get(0).availability(), 1);
    }

    #[test]
    fn add_holder_is_idempotent() {
        let mut t = table(1);
        t.add_holder(0, addr(1));
        t.add_holder(0, addr(1));
        assert_eq!(t.get(0).availability(), 1);
    }

    #[test]
    fn bitfield_round_trip_restores_availability() {
        let mut t = table(2);
        let p = addr(1);
        t.add_holder(0, p.clone());
        t.add_holder(1, p.clone());
        assert_eq!(t.get(0).availability(), 1);
        t.remove_holder(0, &p);
        t.remove_holder(1, &p);
        assert_eq!(t.get(0).availability(), 0);
        assert_eq!(t.get(1).availability(), 0);
    }

    #[test]
    fn disconnect_removes_holder_everywhere() {
        let mut t = table(3);
        let p = addr(1);
        t.add_holder(0, p.clone());
        t.add_holder(2, p.clone());
        t.remove_holder_everywhere(&p);
        assert_eq!(t.get(0).availability(), 0);
        assert_eq!(t.get(2).availability(), 0);
    }

    #[test]
    fn mark_completed_is_terminal() {
        let mut t = table(1);
        assert!(t.mark_completed(0));
        assert!(!t.mark_completed(0));
        assert_eq!(t.completed_count(), 1);
    }
}

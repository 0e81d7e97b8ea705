//! Piece selection: rarest-first ordering with partial-piece reuse and an
//! end-game fallback, plus the swarm-wide `requested_set`/`partial_pieces`
//! state shared with the event dispatcher. Both live under the swarm's
//! single-owner task, which is why they're one struct here rather than two.

use rand::seq::SliceRandom;

use crate::{download::DownloadingPiece, piece_table::PieceTable, Bitfield, PieceIndex};

pub(crate) struct PiecePicker {
    /// Bitset of piece indices currently outstanding (being actively
    /// downloaded by at least one peer, or held as a partial piece).
    requested_set: Vec<bool>,
    /// Orphaned downloads: pieces whose first peer choked before
    /// completion, available for any other peer advertising them to adopt.
    partial_pieces: Vec<DownloadingPiece>,
}

impl PiecePicker {
    pub(crate) fn new(piece_count: usize) -> Self {
        Self {
            requested_set: vec![false; piece_count],
            partial_pieces: Vec::new(),
        }
    }

    pub(crate) fn is_requested(&self, index: PieceIndex) -> bool {
        self.requested_set[index]
    }

    fn mark_requested(&mut self, index: PieceIndex) {
        self.requested_set[index] = true;
    }

    /// Clears a piece's outstanding bit. Called when its peer chokes us
    /// mid-transfer (the bit is cleared rather than left to grow
    /// monotonically, so the piece becomes selectable again) or when it
    /// completes.
    pub(crate) fn clear_requested(&mut self, index: PieceIndex) {
        self.requested_set[index] = false;
    }

    /// Orphans a piece download: removes it from whichever peer was
    /// pursuing it and stores it for reuse, unless it had made no progress
    /// at all, in which case it's simply dropped and its bit cleared.
    pub(crate) fn orphan(&mut self, download: DownloadingPiece) {
        self.clear_requested(download.piece_index());
        if download.received_block_count() > 0 {
            self.partial_pieces.push(download);
        }
    }

    /// Picks the next piece to request from a peer: resume one of its own
    /// in-flight partials first, then the rarest piece it has that nobody
    /// else is fetching, then (once nearly done and end-game is enabled)
    /// the rarest piece regardless of who else is already fetching it.
    pub(crate) fn next_piece_for(
        &mut self,
        peer_bitfield: &Bitfield,
        table: &PieceTable,
        end_game_ratio: f64,
    ) -> Option<DownloadingPiece> {
        // Step A: partial reuse.
        if let Some(pos) = self
            .partial_pieces
            .iter()
            .position(|d| peer_bitfield[d.piece_index()])
        {
            let download = self.partial_pieces.remove(pos);
            self.mark_requested(download.piece_index());
            return Some(download);
        }

        // Step B: peer's interesting set = bitfield - completed - requested.
        let mut interesting: Vec<PieceIndex> = (0..table.len())
            .filter(|&i| peer_bitfield[i])
            .filter(|&i| !table.get(i).is_completed())
            .filter(|&i| !self.requested_set[i])
            .collect();

        if interesting.is_empty() {
            // Step C: end-game check.
            let ratio = table.completed_count() as f64 / table.len() as f64;
            if ratio >= end_game_ratio {
                interesting = (0..table.len())
                    .filter(|&i| peer_bitfield[i])
                    .filter(|&i| !table.get(i).is_completed())
                    .collect();
                if interesting.is_empty() {
                    return None;
                }
            } else {
                return None;
            }
        }

        // Step D: rarest-first among interesting.
        let min_availability = interesting
            .iter()
            .map(|&i| table.get(i).availability())
            .filter(|&a| a > 0)
            .min()?;
        let rarest: Vec<PieceIndex> = interesting
            .into_iter()
            .filter(|&i| table.get(i).availability() == min_availability)
            .collect();
        if rarest.is_empty() {
            return None;
        }

        // Step E: random tie-break.
        let index = *rarest.choose(&mut rand::thread_rng())?;
        self.mark_requested(index);
        Some(DownloadingPiece::new(index, table.get(index).len))
    }

    pub(crate) fn partial_piece_count(&self) -> usize {
        self.partial_pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bitfield;

    fn bf(bits: &[bool]) -> Bitfield {
        let mut b = Bitfield::new();
        for &bit in bits {
            b.push(bit);
        }
        b
    }

    fn table(n: usize) -> PieceTable {
        PieceTable::new(std::iter::repeat(1 << 14).take(n), &vec![[0u8; 20]; n])
    }

    #[test]
    fn rarest_first_picks_lower_availability() {
        let mut t = table(4);
        // piece 0 availability 2, pieces 1 and 2 availability 1.
        let key_a = crate::peer::PeerKey(0);
        let key_b = crate::peer::PeerKey(1);
        t.add_holder(0, key_a);
        t.add_holder(0, key_b);
        t.add_holder(1, key_a);
        t.add_holder(2, key_a);

        let mut picker = PiecePicker::new(4);
        let a_bitfield = bf(&[true, true, true, false]);
        let picked = picker.next_piece_for(&a_bitfield, &t, 0.95).unwrap();
        assert!(picked.piece_index() == 1 || picked.piece_index() == 2);

        let second = picker.next_piece_for(&a_bitfield, &t, 0.95).unwrap();
        assert_ne!(second.piece_index(), picked.piece_index());
        assert!(second.piece_index() == 1 || second.piece_index() == 2);
    }

    #[test]
    fn zero_availability_pieces_are_unselectable() {
        let t = table(2);
        let mut picker = PiecePicker::new(2);
        let bitfield = bf(&[true, true]);
        assert!(picker.next_piece_for(&bitfield, &t, 0.95).is_none());
    }

    #[test]
    fn end_game_allows_rerequest_near_completion() {
        let mut t = table(20);
        let key = crate::peer::PeerKey(0);
        for i in 0..20 {
            t.add_holder(i, key);
        }
        for i in 0..19 {
            t.mark_completed(i);
        }

        let mut picker = PiecePicker::new(20);
        // piece 19 already requested by another peer.
        picker.mark_requested(19);

        let bitfield = bf(&vec![true; 20]);
        let picked = picker.next_piece_for(&bitfield, &t, 0.95);
        assert_eq!(picked.unwrap().piece_index(), 19);
    }

    #[test]
    fn partial_piece_reused_before_rarest_scan() {
        let t = table(4);
        let mut picker = PiecePicker::new(4);
        let mut partial = DownloadingPiece::new(2, 1 << 14);
        let mut out = Vec::new();
        partial.pick_blocks(1, &mut out);
        partial.received_block(out[0]);
        picker.orphan(partial);

        let bitfield = bf(&[false, false, true, false]);
        let picked = picker.next_piece_for(&bitfield, &t, 0.95).unwrap();
        assert_eq!(picked.piece_index(), 2);
        assert_eq!(picker.partial_piece_count(), 0);
    }
}

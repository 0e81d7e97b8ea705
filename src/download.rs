//! Downloading-piece bookkeeping: a piece whose transfer has begun, tracked
//! at the block level so a partial piece can be handed off to another peer
//! if its original peer chokes mid-transfer.

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// A piece in progress: which of its blocks have been requested and which
/// have actually arrived.
#[derive(Clone, Debug)]
pub(crate) struct DownloadingPiece {
    index: PieceIndex,
    piece_len: u32,
    /// `true` for blocks we've already requested (from any peer, in
    /// end-game mode, or just this peer otherwise).
    requested: Vec<bool>,
    /// `true` for blocks whose data has arrived and been handed to the
    /// piece store.
    received: Vec<bool>,
}

impl DownloadingPiece {
    pub(crate) fn new(index: PieceIndex, piece_len: u32) -> Self {
        let n = block_count(piece_len);
        Self {
            index,
            piece_len,
            requested: vec![false; n],
            received: vec![false; n],
        }
    }

    pub(crate) fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Appends up to `count` not-yet-requested blocks into `out` and marks
    /// them requested.
    pub(crate) fn pick_blocks(&mut self, count: usize, out: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        for i in 0..self.requested.len() {
            if picked >= count {
                break;
            }
            if !self.requested[i] {
                self.requested[i] = true;
                let offset = i as u32 * crate::BLOCK_LEN;
                out.push(BlockInfo {
                    piece_index: self.index,
                    offset,
                    len: block_len(self.piece_len, i),
                });
                picked += 1;
            }
        }
    }

    /// Records an already-requested block as received. Re-requesting in
    /// end-game mode means the same block may arrive twice; the second
    /// arrival is a harmless no-op here.
    pub(crate) fn received_block(&mut self, block: BlockInfo) {
        let i = block.index_in_piece();
        debug_assert!(i < self.received.len());
        self.received[i] = true;
    }

    pub(crate) fn count_missing_blocks(&self) -> usize {
        self.received.iter().filter(|r| !**r).count()
    }

    pub(crate) fn received_block_count(&self) -> usize {
        self.received.iter().filter(|r| **r).count()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.count_missing_blocks() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_blocks_does_not_reissue() {
        let mut dl = DownloadingPiece::new(0, 3 * crate::BLOCK_LEN);
        let mut out = Vec::new();
        dl.pick_blocks(2, &mut out);
        assert_eq!(out.len(), 2);
        let mut out2 = Vec::new();
        dl.pick_blocks(2, &mut out2);
        assert_eq!(out2.len(), 1);
    }

    #[test]
    fn partial_piece_retains_received_blocks() {
        let mut dl = DownloadingPiece::new(7, 4 * crate::BLOCK_LEN);
        let mut out = Vec::new();
        dl.pick_blocks(4, &mut out);
        dl.received_block(out[0]);
        dl.received_block(out[1]);
        assert_eq!(dl.received_block_count(), 2);
        assert!(!dl.is_complete());
    }

    #[test]
    fn completion_detected_once_all_blocks_in() {
        let mut dl = DownloadingPiece::new(1, 2 * crate::BLOCK_LEN);
        let mut out = Vec::new();
        dl.pick_blocks(2, &mut out);
        for b in &out {
            dl.received_block(*b);
        }
        assert!(dl.is_complete());
    }
}

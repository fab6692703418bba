//! The piece picker interface the peer layer consumes.
//!
//! Piece selection policy (rarest-first ordering, availability tracking,
//! priorities) lives outside this crate. What the peer needs is the narrow
//! contract below: pick a block, and keep the picker's view of in-flight
//! requests consistent as blocks are requested, aborted, written and
//! finished. [`RequestTracker`] is a policy-free implementation of that
//! contract used for bookkeeping and in tests.

use std::collections::HashMap;

use crate::peer::Bitfield;

/// Identity of a peer within a torrent, stable for the connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey(pub u64);

/// A block coordinate: (piece index, block index within the piece).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockCoord {
    pub piece: u32,
    pub block: u32,
}

impl BlockCoord {
    pub fn new(piece: u32, block: u32) -> Self {
        Self { piece, block }
    }
}

/// A wire-level request: (piece index, byte offset, length).
///
/// `start` is always `block * block_size` for requests we originate;
/// `length` never exceeds the block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub start: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, start: u32, length: u32) -> Self {
        Self {
            piece,
            start,
            length,
        }
    }

    /// The block coordinate this request maps to, given the block size.
    pub fn coord(&self, block_size: u32) -> BlockCoord {
        BlockCoord::new(self.piece, self.start / block_size)
    }
}

/// Rough transfer-rate class of the requesting peer, used by pickers to
/// avoid mixing fast and slow peers on the same piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    Slow,
    Medium,
    Fast,
}

/// Hints passed to [`PiecePicker::pick`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PickHints {
    pub rarest_first: bool,
    pub sequential: bool,
    pub reverse: bool,
    pub prioritize_partials: bool,
    pub time_critical: bool,
    /// Permit picking blocks that are already requested from another peer.
    pub endgame: bool,
    pub on_parole: bool,
    pub prefer_whole_pieces: bool,
}

/// The picker contract.
///
/// All calls happen on the network side; implementations need no internal
/// synchronization beyond what the torrent wraps them in.
pub trait PiecePicker: Send {
    /// Picks the next block to request from a peer owning `peer_has`.
    fn pick(&mut self, peer_has: &Bitfield, hints: PickHints) -> Option<BlockCoord>;

    /// Records that `peer` has the block in flight.
    fn mark_as_downloading(&mut self, block: BlockCoord, peer: PeerKey, speed: SpeedClass);

    /// Drops `peer`'s claim on the block, making it pickable again.
    fn abort_download(&mut self, block: BlockCoord, peer: PeerKey);

    /// Records that the block arrived and is being written to disk.
    fn mark_as_writing(&mut self, block: BlockCoord, peer: PeerKey);

    /// Records that the block's write completed.
    fn mark_as_finished(&mut self, block: BlockCoord, peer: PeerKey);

    /// True once the block has been written out.
    fn is_downloaded(&self, block: BlockCoord) -> bool;

    /// Number of peers currently requesting the block.
    fn num_peers(&self, block: BlockCoord) -> u32;

    /// Blocks of `piece` that are neither requested, writing nor finished.
    fn num_free_blocks(&self, piece: u32) -> u32;

    /// Total number of distinct blocks currently requested from any peer.
    fn in_progress_requests(&self) -> usize;

    /// True while at least one peer has the block requested.
    fn is_requested(&self, block: BlockCoord) -> bool {
        self.num_peers(block) > 0
    }
}

#[derive(Debug, Default, Clone)]
struct BlockState {
    requested_by: Vec<PeerKey>,
    writing: bool,
    finished: bool,
}

/// A policy-free [`PiecePicker`]: sequential pick order, exact request
/// bookkeeping.
///
/// It tracks, per block, which peers have it in flight and whether it has
/// been written, which is all the peer layer's invariants require. The
/// pick order is sequential (optionally reversed, partials first); real
/// availability-driven policy belongs to the embedder.
pub struct RequestTracker {
    piece_count: u32,
    blocks_per_piece: u32,
    last_piece_blocks: u32,
    have: Vec<bool>,
    states: HashMap<BlockCoord, BlockState>,
}

impl RequestTracker {
    pub fn new(piece_count: u32, blocks_per_piece: u32, last_piece_blocks: u32) -> Self {
        Self {
            piece_count,
            blocks_per_piece,
            last_piece_blocks,
            have: vec![false; piece_count as usize],
            states: HashMap::new(),
        }
    }

    /// Marks a piece as owned; its blocks are no longer pickable.
    pub fn set_have(&mut self, piece: u32) {
        if let Some(slot) = self.have.get_mut(piece as usize) {
            *slot = true;
        }
    }

    pub fn blocks_in_piece(&self, piece: u32) -> u32 {
        if piece + 1 == self.piece_count {
            self.last_piece_blocks
        } else {
            self.blocks_per_piece
        }
    }

    /// Total number of distinct blocks currently requested from any peer.
    ///
    /// Matches the union of all peers' download and request queues.
    pub fn in_progress_requests(&self) -> usize {
        self.states
            .values()
            .filter(|s| !s.requested_by.is_empty())
            .count()
    }

    fn state(&self, block: BlockCoord) -> Option<&BlockState> {
        self.states.get(&block)
    }

    fn pickable(&self, block: BlockCoord, endgame: bool) -> bool {
        match self.state(block) {
            None => true,
            Some(s) => {
                if s.finished || s.writing {
                    return false;
                }
                s.requested_by.is_empty() || endgame
            }
        }
    }

    fn pick_in_piece(&self, piece: u32, endgame: bool) -> Option<BlockCoord> {
        // prefer blocks nobody has in flight, even in endgame
        for pass in 0..if endgame { 2 } else { 1 } {
            for block in 0..self.blocks_in_piece(piece) {
                let coord = BlockCoord::new(piece, block);
                if self.pickable(coord, pass == 1) {
                    return Some(coord);
                }
            }
        }
        None
    }

    fn piece_has_progress(&self, piece: u32) -> bool {
        (0..self.blocks_in_piece(piece))
            .any(|b| self.states.contains_key(&BlockCoord::new(piece, b)))
    }
}

impl PiecePicker for RequestTracker {
    fn pick(&mut self, peer_has: &Bitfield, hints: PickHints) -> Option<BlockCoord> {
        let order: Vec<u32> = if hints.reverse {
            (0..self.piece_count).rev().collect()
        } else {
            (0..self.piece_count).collect()
        };

        if hints.prioritize_partials || hints.time_critical {
            for &piece in &order {
                if self.have[piece as usize] || !peer_has.has_piece(piece as usize) {
                    continue;
                }
                if !self.piece_has_progress(piece) {
                    continue;
                }
                if let Some(coord) = self.pick_in_piece(piece, hints.endgame) {
                    return Some(coord);
                }
            }
        }

        for &piece in &order {
            if self.have[piece as usize] || !peer_has.has_piece(piece as usize) {
                continue;
            }
            if let Some(coord) = self.pick_in_piece(piece, hints.endgame) {
                return Some(coord);
            }
        }

        None
    }

    fn mark_as_downloading(&mut self, block: BlockCoord, peer: PeerKey, _speed: SpeedClass) {
        let state = self.states.entry(block).or_default();
        if !state.requested_by.contains(&peer) {
            state.requested_by.push(peer);
        }
    }

    fn abort_download(&mut self, block: BlockCoord, peer: PeerKey) {
        let mut remove = false;
        if let Some(state) = self.states.get_mut(&block) {
            state.requested_by.retain(|p| *p != peer);
            remove = state.requested_by.is_empty() && !state.writing && !state.finished;
        }
        if remove {
            self.states.remove(&block);
        }
    }

    fn mark_as_writing(&mut self, block: BlockCoord, peer: PeerKey) {
        let state = self.states.entry(block).or_default();
        state.requested_by.retain(|p| *p != peer);
        state.writing = true;
    }

    fn mark_as_finished(&mut self, block: BlockCoord, peer: PeerKey) {
        let state = self.states.entry(block).or_default();
        state.requested_by.retain(|p| *p != peer);
        state.writing = false;
        state.finished = true;
    }

    fn is_downloaded(&self, block: BlockCoord) -> bool {
        self.state(block).map(|s| s.finished).unwrap_or(false)
    }

    fn num_peers(&self, block: BlockCoord) -> u32 {
        self.state(block)
            .map(|s| s.requested_by.len() as u32)
            .unwrap_or(0)
    }

    fn num_free_blocks(&self, piece: u32) -> u32 {
        (0..self.blocks_in_piece(piece))
            .filter(|&b| {
                self.state(BlockCoord::new(piece, b))
                    .map(|s| s.requested_by.is_empty() && !s.writing && !s.finished)
                    .unwrap_or(true)
            })
            .count() as u32
    }

    fn in_progress_requests(&self) -> usize {
        RequestTracker::in_progress_requests(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> RequestTracker {
        RequestTracker::new(4, 4, 2)
    }

    fn all_bitfield() -> Bitfield {
        Bitfield::full(4)
    }

    #[test]
    fn test_pick_skips_requested_blocks() {
        let mut t = tracker();
        let peer = PeerKey(1);
        let bf = all_bitfield();

        let first = t.pick(&bf, PickHints::default()).unwrap();
        assert_eq!(first, BlockCoord::new(0, 0));
        t.mark_as_downloading(first, peer, SpeedClass::Medium);

        let second = t.pick(&bf, PickHints::default()).unwrap();
        assert_eq!(second, BlockCoord::new(0, 1));
    }

    #[test]
    fn test_endgame_allows_busy_blocks() {
        let mut t = RequestTracker::new(1, 1, 1);
        let bf = Bitfield::full(1);
        let coord = BlockCoord::new(0, 0);
        t.mark_as_downloading(coord, PeerKey(1), SpeedClass::Fast);

        assert_eq!(t.pick(&bf, PickHints::default()), None);

        let hints = PickHints {
            endgame: true,
            ..Default::default()
        };
        assert_eq!(t.pick(&bf, hints), Some(coord));
    }

    #[test]
    fn test_abort_makes_block_pickable_again() {
        let mut t = tracker();
        let coord = BlockCoord::new(0, 0);
        t.mark_as_downloading(coord, PeerKey(1), SpeedClass::Medium);
        assert!(t.is_requested(coord));

        t.abort_download(coord, PeerKey(1));
        assert!(!t.is_requested(coord));
        assert_eq!(t.pick(&all_bitfield(), PickHints::default()), Some(coord));
    }

    #[test]
    fn test_num_peers_counts_duplicates_once() {
        let mut t = tracker();
        let coord = BlockCoord::new(1, 2);
        t.mark_as_downloading(coord, PeerKey(1), SpeedClass::Slow);
        t.mark_as_downloading(coord, PeerKey(2), SpeedClass::Fast);
        t.mark_as_downloading(coord, PeerKey(1), SpeedClass::Slow);
        assert_eq!(t.num_peers(coord), 2);
    }

    #[test]
    fn test_finished_lifecycle() {
        let mut t = tracker();
        let peer = PeerKey(7);
        let coord = BlockCoord::new(2, 0);

        t.mark_as_downloading(coord, peer, SpeedClass::Medium);
        t.mark_as_writing(coord, peer);
        assert!(!t.is_requested(coord));
        assert!(!t.is_downloaded(coord));

        t.mark_as_finished(coord, peer);
        assert!(t.is_downloaded(coord));
        // the finished block itself is never re-picked
        assert_ne!(
            t.pick(&Bitfield::full(4), PickHints::default()),
            Some(coord)
        );
    }

    #[test]
    fn test_last_piece_block_count() {
        let t = tracker();
        assert_eq!(t.blocks_in_piece(0), 4);
        assert_eq!(t.blocks_in_piece(3), 2);
    }

    #[test]
    fn test_free_blocks_accounting() {
        let mut t = tracker();
        assert_eq!(t.num_free_blocks(0), 4);
        t.mark_as_downloading(BlockCoord::new(0, 0), PeerKey(1), SpeedClass::Medium);
        t.mark_as_writing(BlockCoord::new(0, 1), PeerKey(1));
        assert_eq!(t.num_free_blocks(0), 2);
    }
}

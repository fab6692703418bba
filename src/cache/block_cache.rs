//! Block-level disk cache with an ARC-flavored replacement policy.
//!
//! Pieces live on six lists: `write`, `volatile_read`, `read_lru1` and
//! `read_lru2` with their two ghost shadows. A piece requested once sits in
//! lru1; a second requester promotes it to lru2. The ghost lists carry keys
//! only and extend the reach of promotion: touching a recently evicted
//! piece counts as a frequency hit. Which end of the cache eviction prefers
//! is decided by the last cache operation (miss or ghost hit).
//!
//! Because each access carries a requester token, one peer hammering the
//! blocks of a single piece cannot fake "frequently used": promotion needs
//! a token different from the piece's last requester.
//!
//! Evictions are deferred. Blocks can be pinned (served zero-copy, being
//! hashed, being flushed) and dirty blocks must survive until flushed, so
//! pressure is applied only through [`BlockCache::try_evict_blocks`], which
//! walks the lists oldest-first and skips anything it must not free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::buffer_pool::BufferPool;
use crate::counters::{Counter, Counters};

/// Identity of the storage a cached piece belongs to.
pub type StorageId = u64;

/// Opaque access token; distinct requesters drive ARC promotion.
pub type RequesterId = usize;

/// Cache key: a piece of a particular storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceKey {
    pub storage: StorageId,
    pub piece: u32,
}

impl PieceKey {
    pub fn new(storage: StorageId, piece: u32) -> Self {
        Self { storage, piece }
    }
}

/// The list a cached piece belongs to. Each piece is on exactly one.
///
/// The numeric order matters: [`allocate`] transitions only ever move a
/// piece to a lower state (ghost to proper, read to write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum CacheState {
    Write = 0,
    VolatileRead = 1,
    ReadLru1 = 2,
    ReadLru1Ghost = 3,
    ReadLru2 = 4,
    ReadLru2Ghost = 5,
}

pub const NUM_LISTS: usize = 6;

impl CacheState {
    fn index(self) -> usize {
        self as usize
    }

    pub fn is_ghost(self) -> bool {
        matches!(self, CacheState::ReadLru1Ghost | CacheState::ReadLru2Ghost)
    }

    fn ghost(self) -> Option<CacheState> {
        match self {
            CacheState::ReadLru1 => Some(CacheState::ReadLru1Ghost),
            CacheState::ReadLru2 => Some(CacheState::ReadLru2Ghost),
            _ => None,
        }
    }
}

/// What the previous list-shaping operation was; guides eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheOp {
    Miss,
    GhostHitLru1,
    GhostHitLru2,
}

/// Why a block is pinned. Reasons must balance on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PinReason {
    Hashing = 0,
    Reading = 1,
    Flushing = 2,
}

#[derive(Debug, Default)]
struct BlockSlot {
    buf: Option<Bytes>,
    dirty: bool,
    /// A flush is outstanding on this block.
    pending: bool,
    refcount: u32,
    hits: u32,
    pin_reasons: [u32; 3],
}

struct PartialHash {
    hasher: Sha1,
    /// Number of leading blocks already folded into the hasher.
    hashed_blocks: u32,
}

struct CachedPiece {
    key: PieceKey,
    blocks: Box<[BlockSlot]>,
    num_blocks: u32,
    num_dirty: u32,
    /// Block refcounts summed.
    refcount: u32,
    /// Blocks with a non-zero refcount.
    pinned: u32,
    /// Piece-level pin held by jobs operating on the whole piece.
    piece_refcount: u32,
    outstanding_read: bool,
    outstanding_flush: bool,
    marked_for_deletion: bool,
    hash: Option<PartialHash>,
    expire: Instant,
    state: CacheState,
    last_requester: Option<RequesterId>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl CachedPiece {
    fn blocks_in_piece(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn ok_to_evict(&self) -> bool {
        self.num_blocks == 0
            && self.refcount == 0
            && self.piece_refcount == 0
            && !self.outstanding_read
            && !self.outstanding_flush
    }

    fn hashed_blocks(&self) -> u32 {
        self.hash.as_ref().map(|h| h.hashed_blocks).unwrap_or(0)
    }
}

/// Slab of piece entries with stable indices and a free list. The LRU
/// lists are index chains threaded through the entries.
#[derive(Default)]
struct PieceSlab {
    slots: Vec<Option<CachedPiece>>,
    free: Vec<usize>,
}

impl PieceSlab {
    fn insert(&mut self, piece: CachedPiece) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(piece);
                idx
            }
            None => {
                self.slots.push(Some(piece));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, idx: usize) -> Option<CachedPiece> {
        let piece = self.slots.get_mut(idx)?.take();
        if piece.is_some() {
            self.free.push(idx);
        }
        piece
    }

    fn get(&self, idx: usize) -> Option<&CachedPiece> {
        self.slots.get(idx)?.as_ref()
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut CachedPiece> {
        self.slots.get_mut(idx)?.as_mut()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LruList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// A pinned, zero-copy view of one cached block.
///
/// Holds the block's refcount until dropped; dropping reclaims the
/// reference. The data handle stays valid regardless; the pin is what
/// keeps the cache from overwriting or evicting the slot meanwhile.
pub struct BlockRef {
    cache: Arc<BlockCache>,
    key: PieceKey,
    block: u32,
    data: Bytes,
}

impl BlockRef {
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn key(&self) -> PieceKey {
        self.key
    }

    pub fn block(&self) -> u32 {
        self.block
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.cache.reclaim_block(self.key, self.block);
    }
}

/// A read request against the cache.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub key: PieceKey,
    pub offset: u32,
    pub length: u32,
    pub requester: RequesterId,
    /// Volatile reads don't promote and land in the volatile list.
    pub volatile_read: bool,
}

/// Outcome of [`BlockCache::try_read`].
pub enum TryRead {
    /// The range is not (fully) resident.
    Miss,
    /// A copy buffer could not be allocated.
    OutOfMemory,
    /// Aligned single-block hit served without copying.
    Direct(BlockRef),
    /// Two-block straddle assembled into a fresh buffer.
    Copied(Bytes),
}

/// A batch of dirty blocks to be written out by a disk worker.
pub struct FlushJob {
    pub key: PieceKey,
    pub blocks: Vec<(u32, Bytes)>,
}

/// Aggregate sizes, in blocks, plus per-list piece counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub read_size: usize,
    pub write_size: usize,
    pub pinned_blocks: usize,
    pub list_sizes: [usize; NUM_LISTS],
}

struct Inner {
    slab: PieceSlab,
    map: HashMap<PieceKey, usize>,
    lists: [LruList; NUM_LISTS],
    last_cache_op: CacheOp,
    ghost_size: usize,
    block_size: u32,
    read_cache_size: usize,
    write_cache_size: usize,
    pinned_blocks: usize,
}

/// The shared block cache.
pub struct BlockCache {
    inner: Mutex<Inner>,
    pool: Arc<BufferPool>,
    counters: Arc<Counters>,
    /// Cache capacity in blocks; beyond it, eviction pressure applies.
    capacity: usize,
}

impl BlockCache {
    pub fn new(
        capacity: usize,
        ghost_size: usize,
        pool: Arc<BufferPool>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        let block_size = pool.block_size() as u32;
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slab: PieceSlab::default(),
                map: HashMap::new(),
                lists: [LruList::default(); NUM_LISTS],
                last_cache_op: CacheOp::Miss,
                ghost_size,
                block_size,
                read_cache_size: 0,
                write_cache_size: 0,
                pinned_blocks: 0,
            }),
            pool,
            counters,
            capacity,
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Attempts to serve `req` from the cache.
    ///
    /// An aligned request confined to one block returns a pinned direct
    /// reference; a request straddling two blocks pins both, copies into a
    /// fresh buffer and releases the pins. Anything not fully resident is
    /// a miss.
    pub fn try_read(self: &Arc<Self>, req: &ReadRequest) -> TryRead {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let block_size = inner.block_size;

        let Some(&idx) = inner.map.get(&req.key) else {
            return TryRead::Miss;
        };

        inner.cache_hit(idx, req.requester, req.volatile_read);

        if req.length == 0 {
            return TryRead::Miss;
        }
        let start_block = req.offset / block_size;
        let end_block = (req.offset + req.length - 1) / block_size;

        // every touched block must be resident
        {
            let Some(piece) = inner.slab.get(idx) else {
                return TryRead::Miss;
            };
            for block in start_block..=end_block {
                match piece.blocks.get(block as usize) {
                    Some(slot) if slot.buf.is_some() => {}
                    _ => return TryRead::Miss,
                }
            }
        }

        if start_block == end_block {
            let block_offset = (req.offset % block_size) as usize;
            let Some(data) = inner.pin_block(idx, start_block, PinReason::Reading) else {
                return TryRead::Miss;
            };
            if block_offset + req.length as usize > data.len() {
                inner.unpin_block(idx, start_block, PinReason::Reading, &self.pool);
                return TryRead::Miss;
            }
            inner.sync_pinned_counter(&self.counters);
            let view = data.slice(block_offset..block_offset + req.length as usize);
            drop(guard);
            return TryRead::Direct(BlockRef {
                cache: Arc::clone(self),
                key: req.key,
                block: start_block,
                data: view,
            });
        }

        // two-block straddle: pin, copy, unpin
        let Some(mut copy) = self.pool.try_alloc() else {
            return TryRead::OutOfMemory;
        };

        let first = inner.pin_block(idx, start_block, PinReason::Reading);
        let second = inner.pin_block(idx, end_block, PinReason::Reading);
        let (Some(first), Some(second)) = (first, second) else {
            inner.unpin_block(idx, start_block, PinReason::Reading, &self.pool);
            inner.unpin_block(idx, end_block, PinReason::Reading, &self.pool);
            self.pool.free_mut(copy);
            return TryRead::Miss;
        };

        let block_offset = (req.offset % block_size) as usize;
        let from_first = first.len().saturating_sub(block_offset);
        let from_second = req.length as usize - from_first;
        if from_second > second.len() {
            inner.unpin_block(idx, start_block, PinReason::Reading, &self.pool);
            inner.unpin_block(idx, end_block, PinReason::Reading, &self.pool);
            self.pool.free_mut(copy);
            return TryRead::Miss;
        }

        copy.extend_from_slice(&first[block_offset..]);
        copy.extend_from_slice(&second[..from_second]);

        inner.unpin_block(idx, start_block, PinReason::Reading, &self.pool);
        inner.unpin_block(idx, end_block, PinReason::Reading, &self.pool);

        TryRead::Copied(copy.freeze())
    }

    /// Releases a pinned block reference. Called on [`BlockRef`] drop.
    fn reclaim_block(&self, key: PieceKey, block: u32) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(&idx) = inner.map.get(&key) {
            inner.unpin_block(idx, block, PinReason::Reading, &self.pool);
            inner.sync_pinned_counter(&self.counters);
        }
    }

    /// Installs a freshly received dirty block.
    ///
    /// The piece moves to the write list. An occupied slot is never
    /// overwritten; a redundant incoming buffer goes back to the pool and
    /// the call returns false.
    pub fn add_dirty_block(
        &self,
        key: PieceKey,
        block: u32,
        data: Bytes,
        blocks_in_piece: u32,
        requester: RequesterId,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let idx = inner.allocate_piece(key, blocks_in_piece, CacheState::Write, requester);

        let over = self.blocks_over_capacity(inner, 1);
        if over > 0 {
            inner.try_evict_blocks(over, Some(idx), &self.pool);
        }

        enum Slot {
            Install,
            Replace(Bytes),
            Skip,
        }

        let action = match inner.slab.get_mut(idx) {
            None => Slot::Skip,
            Some(piece) => match piece.blocks.get_mut(block as usize) {
                None => Slot::Skip,
                Some(slot) => {
                    if slot.buf.is_none() {
                        Slot::Install
                    } else if slot.dirty || slot.refcount > 0 || slot.pending {
                        // never overwrite a present block
                        Slot::Skip
                    } else {
                        // leftover read block, e.g. from hash checking
                        match slot.buf.take() {
                            Some(old) => {
                                piece.num_blocks -= 1;
                                Slot::Replace(old)
                            }
                            None => Slot::Install,
                        }
                    }
                }
            },
        };

        match action {
            Slot::Skip => {
                self.pool.free(data);
                return false;
            }
            Slot::Replace(old) => {
                inner.read_cache_size -= 1;
                self.pool.free(old);
            }
            Slot::Install => {}
        }

        if let Some(piece) = inner.slab.get_mut(idx) {
            let slot = &mut piece.blocks[block as usize];
            slot.buf = Some(data);
            slot.dirty = true;
            piece.num_blocks += 1;
            piece.num_dirty += 1;
        }
        inner.write_cache_size += 1;

        inner.advance_hash(idx);
        inner.update_cache_state(idx);
        inner.bump_lru(idx);
        self.publish_counters(inner);
        true
    }

    /// Hangs disk-read results on the piece. Resident blocks are never
    /// replaced; redundant incoming buffers go back to the pool.
    pub fn insert_blocks(
        &self,
        key: PieceKey,
        start_block: u32,
        bufs: Vec<Bytes>,
        blocks_in_piece: u32,
        requester: RequesterId,
        volatile_read: bool,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let state = if volatile_read {
            CacheState::VolatileRead
        } else {
            CacheState::ReadLru1
        };
        // hit handling first: a ghost entry must record its feedback and
        // promote before allocation settles the list
        if let Some(&idx) = inner.map.get(&key) {
            inner.cache_hit(idx, requester, volatile_read);
        }
        let idx = inner.allocate_piece(key, blocks_in_piece, state, requester);

        let over = self.blocks_over_capacity(inner, bufs.len());
        if over > 0 {
            inner.try_evict_blocks(over, Some(idx), &self.pool);
        }

        for (i, buf) in bufs.into_iter().enumerate() {
            let block = start_block as usize + i;
            let mut installed = false;
            if let Some(piece) = inner.slab.get_mut(idx) {
                if let Some(slot) = piece.blocks.get_mut(block) {
                    if slot.buf.is_none() {
                        slot.buf = Some(buf.clone());
                        piece.num_blocks += 1;
                        installed = true;
                    }
                }
            }
            if installed {
                inner.read_cache_size += 1;
            } else {
                self.pool.free(buf);
            }
        }

        if let Some(piece) = inner.slab.get_mut(idx) {
            piece.outstanding_read = false;
        }
        self.publish_counters(inner);
    }

    /// Marks a read job outstanding on the piece so concurrent requests
    /// queue behind it instead of issuing duplicate disk reads.
    ///
    /// Returns false if a read is already in flight.
    pub fn begin_read(&self, key: PieceKey, blocks_in_piece: u32, requester: RequesterId) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner.allocate_piece(key, blocks_in_piece, CacheState::ReadLru1, requester);
        match inner.slab.get_mut(idx) {
            Some(piece) if !piece.outstanding_read => {
                piece.outstanding_read = true;
                true
            }
            _ => false,
        }
    }

    /// Picks the oldest write-list piece with flushable blocks, marks them
    /// pending and pins them for flushing.
    pub fn next_flush_job(&self) -> Option<FlushJob> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut cursor = inner.lists[CacheState::Write.index()].head;
        while let Some(idx) = cursor {
            cursor = inner.slab.get(idx).and_then(|p| p.next);

            let mut blocks = Vec::new();
            let mut key = None;
            if let Some(piece) = inner.slab.get_mut(idx) {
                if piece.num_dirty == 0 {
                    continue;
                }
                for (i, slot) in piece.blocks.iter_mut().enumerate() {
                    if !slot.dirty || slot.pending {
                        continue;
                    }
                    if let Some(buf) = slot.buf.clone() {
                        slot.pending = true;
                        blocks.push((i as u32, buf));
                    }
                }
                if !blocks.is_empty() {
                    piece.outstanding_flush = true;
                    key = Some(piece.key);
                }
            }

            let Some(key) = key else {
                continue;
            };
            for &(block, _) in &blocks {
                let _ = inner.pin_block(idx, block, PinReason::Flushing);
            }
            inner.sync_pinned_counter(&self.counters);
            return Some(FlushJob { key, blocks });
        }
        None
    }

    /// Marks flushed blocks clean, rebalances read/write sizes and drops
    /// the flushing pins.
    pub fn blocks_flushed(&self, key: PieceKey, flushed: &[u32]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(&idx) = inner.map.get(&key) else {
            return;
        };

        let mut count = 0u32;
        if let Some(piece) = inner.slab.get_mut(idx) {
            for &block in flushed {
                let Some(slot) = piece.blocks.get_mut(block as usize) else {
                    continue;
                };
                if !slot.dirty {
                    continue;
                }
                slot.pending = false;
                // clear dirty before dropping the pin: an unpinned clean
                // block is immediately evictable
                slot.dirty = false;
                count += 1;
            }
            piece.num_dirty = piece.num_dirty.saturating_sub(count);
            if piece.blocks.iter().all(|s| !s.pending) {
                piece.outstanding_flush = false;
            }
        }

        for &block in flushed {
            inner.unpin_block(idx, block, PinReason::Flushing, &self.pool);
        }

        inner.write_cache_size = inner.write_cache_size.saturating_sub(count as usize);
        inner.read_cache_size += count as usize;

        inner.update_cache_state(idx);
        inner.sync_pinned_counter(&self.counters);
        self.publish_counters(inner);
    }

    /// Reverts the pending marks of a failed flush so the blocks stay
    /// dirty and are retried later, and drops the flushing pins.
    pub fn flush_failed(&self, key: PieceKey, blocks: &[u32]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(&idx) = inner.map.get(&key) else {
            return;
        };

        if let Some(piece) = inner.slab.get_mut(idx) {
            for &block in blocks {
                if let Some(slot) = piece.blocks.get_mut(block as usize) {
                    slot.pending = false;
                }
            }
            if piece.blocks.iter().all(|s| !s.pending) {
                piece.outstanding_flush = false;
            }
        }
        for &block in blocks {
            inner.unpin_block(idx, block, PinReason::Flushing, &self.pool);
        }
        inner.sync_pinned_counter(&self.counters);
    }

    /// Pins one block for the given reason. Returns false if the block is
    /// not resident.
    pub fn inc_block_refcount(&self, key: PieceKey, block: u32, reason: PinReason) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(&idx) = inner.map.get(&key) else {
            return false;
        };
        let pinned = inner.pin_block(idx, block, reason).is_some();
        inner.sync_pinned_counter(&self.counters);
        pinned
    }

    /// Releases a pin taken with [`BlockCache::inc_block_refcount`].
    pub fn dec_block_refcount(&self, key: PieceKey, block: u32, reason: PinReason) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(&idx) = inner.map.get(&key) {
            inner.unpin_block(idx, block, reason, &self.pool);
            inner.sync_pinned_counter(&self.counters);
        }
    }

    /// Evicts up to `num` blocks under pressure. Returns how many could
    /// not be evicted.
    pub fn try_evict_blocks(&self, num: usize) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let remaining = inner.try_evict_blocks(num, None, &self.pool);
        self.publish_counters(inner);
        remaining
    }

    /// Evicts the piece if possible, or marks it for deletion so the last
    /// reference drop erases it.
    pub fn mark_for_deletion(&self, key: PieceKey) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(&idx) = inner.map.get(&key) else {
            return;
        };
        if !inner.delete_piece(idx, &self.pool) {
            if let Some(piece) = inner.slab.get_mut(idx) {
                piece.marked_for_deletion = true;
            }
        }
        self.publish_counters(inner);
    }

    /// Drops every piece belonging to `storage`. Pinned or in-flight
    /// pieces are marked for deletion instead.
    pub fn remove_storage(&self, storage: StorageId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let keys: Vec<PieceKey> = inner
            .map
            .keys()
            .filter(|k| k.storage == storage)
            .copied()
            .collect();
        for key in keys {
            if let Some(&idx) = inner.map.get(&key) {
                if !inner.delete_piece(idx, &self.pool) {
                    if let Some(piece) = inner.slab.get_mut(idx) {
                        piece.marked_for_deletion = true;
                    }
                }
            }
        }
        self.publish_counters(inner);
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock();
        let mut list_sizes = [0usize; NUM_LISTS];
        for (i, list) in guard.lists.iter().enumerate() {
            list_sizes[i] = list.len;
        }
        CacheStats {
            read_size: guard.read_cache_size,
            write_size: guard.write_cache_size,
            pinned_blocks: guard.pinned_blocks,
            list_sizes,
        }
    }

    /// The state the piece is currently cached under, if any.
    pub fn piece_state(&self, key: PieceKey) -> Option<CacheState> {
        let guard = self.inner.lock();
        let idx = *guard.map.get(&key)?;
        guard.slab.get(idx).map(|p| p.state)
    }

    /// (filled, dirty) block counts of a cached piece.
    pub fn piece_counts(&self, key: PieceKey) -> Option<(u32, u32)> {
        let guard = self.inner.lock();
        let idx = *guard.map.get(&key)?;
        guard.slab.get(idx).map(|p| (p.num_blocks, p.num_dirty))
    }

    /// Outstanding pin counts of one block, by reason (hashing, reading,
    /// flushing). Diagnostic: a healthy cache balances these to zero.
    pub fn block_pin_reasons(&self, key: PieceKey, block: u32) -> Option<[u32; 3]> {
        let guard = self.inner.lock();
        let idx = *guard.map.get(&key)?;
        let piece = guard.slab.get(idx)?;
        piece.blocks.get(block as usize).map(|s| s.pin_reasons)
    }

    /// How often one block has been pinned since it entered the cache.
    pub fn block_hits(&self, key: PieceKey, block: u32) -> Option<u32> {
        let guard = self.inner.lock();
        let idx = *guard.map.get(&key)?;
        let piece = guard.slab.get(idx)?;
        piece.blocks.get(block as usize).map(|s| s.hits)
    }

    /// Blocks that would be resident beyond capacity were `extra` added.
    fn blocks_over_capacity(&self, inner: &Inner, extra: usize) -> usize {
        (inner.read_cache_size + inner.write_cache_size + extra).saturating_sub(self.capacity)
    }

    fn publish_counters(&self, inner: &Inner) {
        self.counters
            .set(Counter::ReadCacheBlocks, inner.read_cache_size as i64);
        self.counters
            .set(Counter::WriteCacheBlocks, inner.write_cache_size as i64);
        self.counters.set(
            Counter::ArcWritePieces,
            inner.lists[CacheState::Write.index()].len as i64,
        );
        self.counters.set(
            Counter::ArcVolatilePieces,
            inner.lists[CacheState::VolatileRead.index()].len as i64,
        );
        self.counters.set(
            Counter::ArcLru1Pieces,
            inner.lists[CacheState::ReadLru1.index()].len as i64,
        );
        self.counters.set(
            Counter::ArcLru1GhostPieces,
            inner.lists[CacheState::ReadLru1Ghost.index()].len as i64,
        );
        self.counters.set(
            Counter::ArcLru2Pieces,
            inner.lists[CacheState::ReadLru2.index()].len as i64,
        );
        self.counters.set(
            Counter::ArcLru2GhostPieces,
            inner.lists[CacheState::ReadLru2Ghost.index()].len as i64,
        );
    }
}

impl Inner {
    fn list_push_back(&mut self, idx: usize) {
        let state = match self.slab.get(idx) {
            Some(piece) => piece.state,
            None => return,
        };
        let old_tail = self.lists[state.index()].tail;

        if let Some(piece) = self.slab.get_mut(idx) {
            piece.prev = old_tail;
            piece.next = None;
        }
        match old_tail {
            Some(tail) => {
                if let Some(prev) = self.slab.get_mut(tail) {
                    prev.next = Some(idx);
                }
            }
            None => self.lists[state.index()].head = Some(idx),
        }
        self.lists[state.index()].tail = Some(idx);
        self.lists[state.index()].len += 1;
    }

    fn list_unlink(&mut self, idx: usize) {
        let (state, prev, next) = match self.slab.get(idx) {
            Some(piece) => (piece.state, piece.prev, piece.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(prev_piece) = self.slab.get_mut(p) {
                    prev_piece.next = next;
                }
            }
            None => self.lists[state.index()].head = next,
        }
        match next {
            Some(n) => {
                if let Some(next_piece) = self.slab.get_mut(n) {
                    next_piece.prev = prev;
                }
            }
            None => self.lists[state.index()].tail = prev,
        }
        self.lists[state.index()].len -= 1;

        if let Some(piece) = self.slab.get_mut(idx) {
            piece.prev = None;
            piece.next = None;
        }
    }

    fn bump_lru(&mut self, idx: usize) {
        self.list_unlink(idx);
        if let Some(piece) = self.slab.get_mut(idx) {
            piece.expire = Instant::now();
        }
        self.list_push_back(idx);
    }

    fn set_state(&mut self, idx: usize, state: CacheState) {
        self.list_unlink(idx);
        if let Some(piece) = self.slab.get_mut(idx) {
            piece.state = state;
            piece.expire = Instant::now();
        }
        self.list_push_back(idx);
    }

    /// Finds or creates the piece entry, moving an existing entry down to
    /// `state` if needed (ghost to proper, read to write).
    fn allocate_piece(
        &mut self,
        key: PieceKey,
        blocks_in_piece: u32,
        state: CacheState,
        requester: RequesterId,
    ) -> usize {
        if let Some(&idx) = self.map.get(&key) {
            let demote = match self.slab.get_mut(idx) {
                Some(piece) => {
                    piece.marked_for_deletion = false;
                    // downward moves only: a dirty piece needs the write
                    // list, a ghost pulled back needs a proper list
                    if state == CacheState::Write {
                        piece.state != CacheState::Write
                    } else {
                        piece.state.is_ghost()
                    }
                }
                None => false,
            };
            if demote {
                self.set_state(idx, state);
            }
            return idx;
        }

        let blocks = (0..blocks_in_piece)
            .map(|_| BlockSlot::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let piece = CachedPiece {
            key,
            blocks,
            num_blocks: 0,
            num_dirty: 0,
            refcount: 0,
            pinned: 0,
            piece_refcount: 0,
            outstanding_read: false,
            outstanding_flush: false,
            marked_for_deletion: false,
            hash: None,
            expire: Instant::now(),
            state,
            last_requester: Some(requester),
            prev: None,
            next: None,
        };
        let idx = self.slab.insert(piece);
        self.map.insert(key, idx);
        self.list_push_back(idx);

        // a fresh read piece means the last shaping event was a miss
        if state == CacheState::ReadLru1 {
            self.last_cache_op = CacheOp::Miss;
        }
        idx
    }

    /// ARC hit handling: promotion, requester tokens, ghost feedback.
    fn cache_hit(&mut self, idx: usize, requester: RequesterId, volatile_read: bool) {
        let (state, same_requester) = match self.slab.get(idx) {
            Some(piece) => (piece.state, piece.last_requester == Some(requester)),
            None => return,
        };

        let mut target = CacheState::ReadLru2;

        if same_requester {
            // repeated access by one requester is not frequency
            match state {
                CacheState::ReadLru1 | CacheState::ReadLru2 | CacheState::Write => return,
                CacheState::VolatileRead if volatile_read => return,
                CacheState::ReadLru1Ghost => target = CacheState::ReadLru1,
                _ => {}
            }
        }

        if state == CacheState::VolatileRead {
            // a volatile hit leaves a volatile piece alone; a proper read
            // promotes it to lru1
            if volatile_read {
                return;
            }
            target = CacheState::ReadLru1;
        }

        if let Some(piece) = self.slab.get_mut(idx) {
            piece.last_requester = Some(requester);
        }

        // only pieces on the ARC lists move
        if state == CacheState::Write {
            return;
        }

        // a ghost hit tells us which proper list was undersized; remember
        // it for the next eviction
        match state {
            CacheState::ReadLru1Ghost => self.last_cache_op = CacheOp::GhostHitLru1,
            CacheState::ReadLru2Ghost => self.last_cache_op = CacheOp::GhostHitLru2,
            _ => {}
        }

        if state == target {
            self.bump_lru(idx);
        } else {
            self.set_state(idx, target);
        }
    }

    /// Moves a piece between the write and read sides to match its dirty
    /// state: a dirty piece belongs to `write`, a fully flushed piece
    /// returns to `read_lru1`.
    fn update_cache_state(&mut self, idx: usize) {
        let (state, num_dirty) = match self.slab.get(idx) {
            Some(piece) => (piece.state, piece.num_dirty),
            None => return,
        };
        let desired = if num_dirty > 0 {
            CacheState::Write
        } else if state == CacheState::Write {
            CacheState::ReadLru1
        } else {
            state
        };
        if desired != state {
            self.set_state(idx, desired);
        }
    }

    /// Folds resident leading blocks into the deferred piece hash.
    fn advance_hash(&mut self, idx: usize) {
        let Some(piece) = self.slab.get_mut(idx) else {
            return;
        };
        if piece.hash.is_none() {
            let first_resident = piece
                .blocks
                .first()
                .map(|s| s.buf.is_some())
                .unwrap_or(false);
            if !first_resident {
                return;
            }
            piece.hash = Some(PartialHash {
                hasher: Sha1::new(),
                hashed_blocks: 0,
            });
        }
        let blocks_in_piece = piece.blocks_in_piece();
        if let Some(hash) = piece.hash.as_mut() {
            while hash.hashed_blocks < blocks_in_piece {
                match piece.blocks[hash.hashed_blocks as usize].buf.as_ref() {
                    Some(buf) => {
                        hash.hasher.update(buf);
                        hash.hashed_blocks += 1;
                    }
                    None => break,
                }
            }
        }
    }

    /// Pins a block and returns its data. `None` when not resident.
    fn pin_block(&mut self, idx: usize, block: u32, reason: PinReason) -> Option<Bytes> {
        let piece = self.slab.get_mut(idx)?;
        let (data, first_pin) = {
            let slot = piece.blocks.get_mut(block as usize)?;
            let data = slot.buf.clone()?;
            let first_pin = slot.refcount == 0;
            slot.refcount += 1;
            slot.hits += 1;
            slot.pin_reasons[reason as usize] += 1;
            (data, first_pin)
        };
        if first_pin {
            piece.pinned += 1;
            self.pinned_blocks += 1;
        }
        piece.refcount += 1;
        Some(data)
    }

    fn unpin_block(&mut self, idx: usize, block: u32, reason: PinReason, pool: &BufferPool) {
        let mut finish_deletion = false;
        let mut last_pin = false;
        if let Some(piece) = self.slab.get_mut(idx) {
            {
                let Some(slot) = piece.blocks.get_mut(block as usize) else {
                    return;
                };
                if slot.refcount == 0 {
                    return;
                }
                slot.refcount -= 1;
                if slot.pin_reasons[reason as usize] > 0 {
                    slot.pin_reasons[reason as usize] -= 1;
                }
                last_pin = slot.refcount == 0;
            }
            if last_pin {
                piece.pinned -= 1;
            }
            piece.refcount -= 1;
            finish_deletion = piece.marked_for_deletion && piece.refcount == 0;
        }
        if last_pin {
            self.pinned_blocks = self.pinned_blocks.saturating_sub(1);
        }
        if finish_deletion {
            let _ = self.delete_piece(idx, pool);
        }
    }

    fn sync_pinned_counter(&self, counters: &Counters) {
        counters.set(Counter::PinnedCacheBlocks, self.pinned_blocks as i64);
    }

    /// Frees a single resident block slot, adjusting counts. The caller
    /// has verified the block is evictable.
    fn free_block(&mut self, idx: usize, block: usize, pool: &BufferPool) {
        let Some(piece) = self.slab.get_mut(idx) else {
            return;
        };
        let (buf, was_dirty) = {
            let Some(slot) = piece.blocks.get_mut(block) else {
                return;
            };
            let Some(buf) = slot.buf.take() else {
                return;
            };
            let was_dirty = slot.dirty;
            slot.dirty = false;
            (buf, was_dirty)
        };
        if was_dirty {
            piece.num_dirty -= 1;
        }
        piece.num_blocks -= 1;
        if was_dirty {
            self.write_cache_size -= 1;
        } else {
            self.read_cache_size -= 1;
        }
        pool.free(buf);
    }

    /// Frees every evictable block of the piece and erases the entry once
    /// empty. No ghost is left behind; this is removal, not replacement.
    /// Returns false while pins or outstanding I/O keep the entry alive.
    fn delete_piece(&mut self, idx: usize, pool: &BufferPool) -> bool {
        let blocks = match self.slab.get(idx) {
            Some(piece) => piece.blocks_in_piece() as usize,
            None => return true,
        };
        for block in 0..blocks {
            let evictable = self
                .slab
                .get(idx)
                .and_then(|p| p.blocks.get(block))
                .map(|s| s.buf.is_some() && s.refcount == 0 && !s.pending)
                .unwrap_or(false);
            if evictable {
                self.free_block(idx, block, pool);
            }
        }

        let Some(piece) = self.slab.get(idx) else {
            return true;
        };
        if !piece.ok_to_evict() {
            return false;
        }
        self.erase_piece(idx);
        true
    }

    fn erase_piece(&mut self, idx: usize) {
        self.list_unlink(idx);
        if let Some(piece) = self.slab.remove(idx) {
            self.map.remove(&piece.key);
        }
    }

    /// Retires an empty read piece into its ghost list, bounding the ghost
    /// by erasing its oldest entries.
    fn move_to_ghost(&mut self, idx: usize) {
        let state = match self.slab.get(idx) {
            Some(piece) => piece.state,
            None => return,
        };
        if state == CacheState::VolatileRead {
            self.erase_piece(idx);
            return;
        }
        let Some(ghost) = state.ghost() else {
            return;
        };

        while self.lists[ghost.index()].len >= self.ghost_size {
            let Some(front) = self.lists[ghost.index()].head else {
                break;
            };
            self.erase_piece(front);
        }

        self.list_unlink(idx);
        if let Some(piece) = self.slab.get_mut(idx) {
            piece.state = ghost;
            piece.hash = None;
        }
        self.list_push_back(idx);
    }

    /// The eviction walk. Returns the count that could not be evicted.
    fn try_evict_blocks(
        &mut self,
        mut num: usize,
        ignore: Option<usize>,
        pool: &BufferPool,
    ) -> usize {
        if num == 0 {
            return 0;
        }

        // the volatile list goes first, then the ARC end chosen by the
        // last cache operation
        let (second, third) = match self.last_cache_op {
            CacheOp::Miss => {
                // a miss evicts from the larger list, keeping them balanced
                if self.lists[CacheState::ReadLru2.index()].len
                    > self.lists[CacheState::ReadLru1.index()].len
                {
                    (CacheState::ReadLru2, CacheState::ReadLru1)
                } else {
                    (CacheState::ReadLru1, CacheState::ReadLru2)
                }
            }
            CacheOp::GhostHitLru1 => (CacheState::ReadLru2, CacheState::ReadLru1),
            CacheOp::GhostHitLru2 => (CacheState::ReadLru1, CacheState::ReadLru2),
        };

        for state in [CacheState::VolatileRead, second, third] {
            if num == 0 {
                break;
            }
            num = self.evict_from_list(state, num, ignore, pool);
        }

        // fall back to clean blocks inside write-list pieces: hashed
        // prefix first, then anything clean
        if num > 0 && self.read_cache_size > self.pinned_blocks {
            for pass in 0..2 {
                if num == 0 {
                    break;
                }
                num = self.evict_from_write_list(num, ignore, pool, pass == 0);
            }
        }

        num
    }

    fn evict_from_list(
        &mut self,
        state: CacheState,
        mut num: usize,
        ignore: Option<usize>,
        pool: &BufferPool,
    ) -> usize {
        let mut cursor = self.lists[state.index()].head;
        while let Some(idx) = cursor {
            if num == 0 {
                break;
            }
            cursor = self.slab.get(idx).and_then(|p| p.next);

            if Some(idx) == ignore {
                continue;
            }

            let (evictable_piece, fully_pinned, blocks) = match self.slab.get(idx) {
                Some(piece) => (
                    piece.ok_to_evict(),
                    piece.num_blocks <= piece.pinned,
                    piece.blocks_in_piece() as usize,
                ),
                None => continue,
            };
            if evictable_piece {
                self.move_to_ghost(idx);
                continue;
            }
            if fully_pinned {
                continue;
            }

            for block in 0..blocks {
                if num == 0 {
                    break;
                }
                let evictable = self
                    .slab
                    .get(idx)
                    .and_then(|p| p.blocks.get(block))
                    .map(|s| s.buf.is_some() && s.refcount == 0 && !s.dirty && !s.pending)
                    .unwrap_or(false);
                if evictable {
                    self.free_block(idx, block, pool);
                    num -= 1;
                }
            }

            if self.slab.get(idx).map(|p| p.ok_to_evict()).unwrap_or(false) {
                self.move_to_ghost(idx);
            }
        }
        num
    }

    fn evict_from_write_list(
        &mut self,
        mut num: usize,
        ignore: Option<usize>,
        pool: &BufferPool,
        hashed_only: bool,
    ) -> usize {
        let mut cursor = self.lists[CacheState::Write.index()].head;
        while let Some(idx) = cursor {
            if num == 0 {
                break;
            }
            cursor = self.slab.get(idx).and_then(|p| p.next);

            if Some(idx) == ignore {
                continue;
            }
            let (evictable_piece, all_dirty, end) = match self.slab.get(idx) {
                Some(piece) => (
                    piece.ok_to_evict(),
                    piece.num_dirty == piece.num_blocks,
                    if hashed_only {
                        piece.hashed_blocks() as usize
                    } else {
                        piece.blocks_in_piece() as usize
                    },
                ),
                None => continue,
            };
            if evictable_piece {
                self.erase_piece(idx);
                continue;
            }
            if all_dirty {
                continue;
            }

            for block in 0..end {
                if num == 0 {
                    break;
                }
                let evictable = self
                    .slab
                    .get(idx)
                    .and_then(|p| p.blocks.get(block))
                    .map(|s| s.buf.is_some() && s.refcount == 0 && !s.dirty && !s.pending)
                    .unwrap_or(false);
                if evictable {
                    self.free_block(idx, block, pool);
                    num -= 1;
                }
            }

            if self.slab.get(idx).map(|p| p.ok_to_evict()).unwrap_or(false) {
                self.erase_piece(idx);
            }
        }
        num
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache(capacity: usize) -> Arc<BlockCache> {
        let pool = BufferPool::new(16 * 1024, capacity * 4);
        BlockCache::new(capacity, 4, pool, Counters::new())
    }

    fn block(cache: &BlockCache, fill: u8) -> Bytes {
        let mut buf = cache.pool().try_alloc().expect("pool budget");
        buf.extend_from_slice(&vec![fill; 16 * 1024]);
        buf.freeze()
    }

    fn read_req(key: PieceKey, offset: u32, length: u32, requester: RequesterId) -> ReadRequest {
        ReadRequest {
            key,
            offset,
            length,
            requester,
            volatile_read: false,
        }
    }

    #[test]
    fn test_dirty_block_lands_in_write_list() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        cache.add_dirty_block(key, 0, block(&cache, 1), 4, 7);

        assert_eq!(cache.piece_state(key), Some(CacheState::Write));
        assert_eq!(cache.piece_counts(key), Some((1, 1)));
        assert_eq!(cache.stats().write_size, 1);
        assert_eq!(cache.stats().read_size, 0);
    }

    #[test]
    fn test_present_block_is_never_overwritten() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        cache.add_dirty_block(key, 0, block(&cache, 1), 4, 7);
        cache.add_dirty_block(key, 0, block(&cache, 2), 4, 7);

        assert_eq!(cache.piece_counts(key), Some((1, 1)));
        match cache.try_read(&read_req(key, 0, 16 * 1024, 9)) {
            TryRead::Direct(view) => assert_eq!(view.data()[0], 1),
            _ => panic!("expected direct hit"),
        }
    }

    #[test]
    fn test_flush_cycle_moves_piece_to_read_lru1() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 3);
        cache.add_dirty_block(key, 0, block(&cache, 1), 2, 7);
        cache.add_dirty_block(key, 1, block(&cache, 2), 2, 7);
        assert_eq!(cache.piece_counts(key), Some((2, 2)));

        let job = cache.next_flush_job().expect("dirty blocks to flush");
        assert_eq!(job.key, key);
        assert_eq!(job.blocks.len(), 2);
        // pending blocks are pinned for the duration of the flush
        assert_eq!(cache.stats().pinned_blocks, 2);

        let indices: Vec<u32> = job.blocks.iter().map(|(i, _)| *i).collect();
        cache.blocks_flushed(key, &indices);

        assert_eq!(cache.piece_counts(key), Some((2, 0)));
        assert_eq!(cache.piece_state(key), Some(CacheState::ReadLru1));
        assert_eq!(cache.stats().write_size, 0);
        assert_eq!(cache.stats().read_size, 2);
        assert_eq!(cache.stats().pinned_blocks, 0);
    }

    fn flushed_piece(cache: &Arc<BlockCache>, key: PieceKey, requester: RequesterId) {
        cache.add_dirty_block(key, 0, block(cache, key.piece as u8), 1, requester);
        let job = cache.next_flush_job().expect("flush job");
        assert_eq!(job.key, key);
        cache.blocks_flushed(key, &[0]);
    }

    #[test]
    fn test_second_requester_promotes_to_lru2() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 7);
        flushed_piece(&cache, key, 100);
        assert_eq!(cache.piece_state(key), Some(CacheState::ReadLru1));

        // requester A touches it: same as last writer? last_requester is
        // the dirty-block requester, so a different token promotes
        match cache.try_read(&read_req(key, 0, 1024, 100)) {
            TryRead::Direct(_) => {}
            _ => panic!("expected hit"),
        }
        assert_eq!(cache.piece_state(key), Some(CacheState::ReadLru1));

        match cache.try_read(&read_req(key, 0, 1024, 200)) {
            TryRead::Direct(_) => {}
            _ => panic!("expected hit"),
        }
        assert_eq!(cache.piece_state(key), Some(CacheState::ReadLru2));
    }

    #[test]
    fn test_same_requester_does_not_promote() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 7);
        flushed_piece(&cache, key, 100);

        for _ in 0..5 {
            match cache.try_read(&read_req(key, 0, 512, 100)) {
                TryRead::Direct(_) => {}
                _ => panic!("expected hit"),
            }
        }
        assert_eq!(cache.piece_state(key), Some(CacheState::ReadLru1));
    }

    #[test]
    fn test_straddling_read_copies() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        cache.add_dirty_block(key, 0, block(&cache, 0xAA), 2, 7);
        cache.add_dirty_block(key, 1, block(&cache, 0xBB), 2, 7);

        let req = read_req(key, 16 * 1024 - 512, 1024, 9);
        match cache.try_read(&req) {
            TryRead::Copied(data) => {
                assert_eq!(data.len(), 1024);
                assert!(data[..512].iter().all(|&b| b == 0xAA));
                assert!(data[512..].iter().all(|&b| b == 0xBB));
            }
            _ => panic!("expected copied straddle"),
        }
        // the straddle pins were transient
        assert_eq!(cache.stats().pinned_blocks, 0);
    }

    #[test]
    fn test_miss_on_absent_piece_and_block() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        assert!(matches!(
            cache.try_read(&read_req(key, 0, 1024, 1)),
            TryRead::Miss
        ));

        cache.add_dirty_block(key, 0, block(&cache, 1), 4, 7);
        // block 2 was never written
        assert!(matches!(
            cache.try_read(&read_req(key, 2 * 16 * 1024, 1024, 1)),
            TryRead::Miss
        ));
    }

    #[test]
    fn test_eviction_skips_pinned_blocks() {
        let cache = make_cache(64);
        let key_a = PieceKey::new(1, 0);
        let key_b = PieceKey::new(1, 1);
        flushed_piece(&cache, key_a, 7);
        flushed_piece(&cache, key_b, 7);
        assert_eq!(cache.stats().read_size, 2);

        // pin piece A's only block, as an in-flight upload would
        let view = match cache.try_read(&read_req(key_a, 0, 1024, 9)) {
            TryRead::Direct(view) => view,
            _ => panic!("expected hit"),
        };
        assert_eq!(cache.stats().pinned_blocks, 1);

        let remaining = cache.try_evict_blocks(2);
        // B's block went; A's pinned block could not
        assert_eq!(remaining, 1);
        assert_eq!(cache.stats().read_size, 1);
        assert!(matches!(
            cache.try_read(&read_req(key_a, 0, 1024, 9)),
            TryRead::Direct(_)
        ));

        drop(view);
        assert_eq!(cache.stats().pinned_blocks, 0);
        assert_eq!(cache.try_evict_blocks(1), 0);
        assert_eq!(cache.stats().read_size, 0);
    }

    #[test]
    fn test_dirty_blocks_are_never_evicted() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        cache.add_dirty_block(key, 0, block(&cache, 1), 2, 7);

        let remaining = cache.try_evict_blocks(1);
        assert_eq!(remaining, 1);
        assert_eq!(cache.piece_counts(key), Some((1, 1)));
    }

    #[test]
    fn test_evicted_piece_moves_to_ghost_and_back() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 5);
        flushed_piece(&cache, key, 100);

        assert_eq!(cache.try_evict_blocks(1), 0);
        assert_eq!(cache.piece_state(key), Some(CacheState::ReadLru1Ghost));
        // ghosts hold no blocks
        assert_eq!(cache.piece_counts(key), Some((0, 0)));

        // a ghost hit counts as frequency: re-inserting promotes to lru2
        cache.insert_blocks(key, 0, vec![block(&cache, 9)], 1, 200, false);
        assert_eq!(cache.piece_state(key), Some(CacheState::ReadLru2));
    }

    #[test]
    fn test_ghost_list_is_bounded() {
        let cache = make_cache(64);
        // ghost_size is 4; retire 6 pieces into the lru1 ghost
        for piece in 0..6 {
            let key = PieceKey::new(1, piece);
            flushed_piece(&cache, key, 50);
            assert_eq!(cache.try_evict_blocks(1), 0);
        }
        let stats = cache.stats();
        assert_eq!(stats.list_sizes[CacheState::ReadLru1Ghost.index()], 4);
        // the oldest ghosts were erased outright
        assert_eq!(cache.piece_state(PieceKey::new(1, 0)), None);
        assert_eq!(cache.piece_state(PieceKey::new(1, 1)), None);
    }

    #[test]
    fn test_volatile_pieces_evict_first() {
        let cache = make_cache(64);
        let volatile = PieceKey::new(1, 0);
        let regular = PieceKey::new(1, 1);
        cache.insert_blocks(volatile, 0, vec![block(&cache, 1)], 1, 7, true);
        flushed_piece(&cache, regular, 7);

        assert_eq!(cache.piece_state(volatile), Some(CacheState::VolatileRead));

        assert_eq!(cache.try_evict_blocks(1), 0);
        // the volatile piece went first and left no ghost
        assert_eq!(cache.piece_state(volatile), None);
        assert!(cache.piece_state(regular).is_some());
    }

    #[test]
    fn test_volatile_piece_promotes_on_proper_read() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        cache.insert_blocks(key, 0, vec![block(&cache, 1)], 1, 7, true);
        assert_eq!(cache.piece_state(key), Some(CacheState::VolatileRead));

        match cache.try_read(&read_req(key, 0, 1024, 8)) {
            TryRead::Direct(_) => {}
            _ => panic!("expected hit"),
        }
        assert_eq!(cache.piece_state(key), Some(CacheState::ReadLru1));
    }

    #[test]
    fn test_write_list_fallback_evicts_clean_blocks() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        // block 0 dirty then flushed (clean), block 1 still dirty
        cache.add_dirty_block(key, 0, block(&cache, 1), 2, 7);
        let job = cache.next_flush_job().expect("flush job");
        let indices: Vec<u32> = job.blocks.iter().map(|(i, _)| *i).collect();
        cache.blocks_flushed(key, &indices);
        cache.add_dirty_block(key, 1, block(&cache, 2), 2, 7);
        assert_eq!(cache.piece_state(key), Some(CacheState::Write));
        assert_eq!(cache.piece_counts(key), Some((2, 1)));

        // read lists are empty, so only the write-list fallback can help
        let remaining = cache.try_evict_blocks(2);
        assert_eq!(remaining, 1);
        assert_eq!(cache.piece_counts(key), Some((1, 1)));
    }

    #[test]
    fn test_remove_storage_drops_pieces() {
        let cache = make_cache(64);
        flushed_piece(&cache, PieceKey::new(1, 0), 7);
        flushed_piece(&cache, PieceKey::new(2, 0), 7);

        cache.remove_storage(1);
        assert_eq!(cache.piece_state(PieceKey::new(1, 0)), None);
        assert!(cache.piece_state(PieceKey::new(2, 0)).is_some());
    }

    #[test]
    fn test_marked_for_deletion_waits_for_pin() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        flushed_piece(&cache, key, 7);

        let view = match cache.try_read(&read_req(key, 0, 1024, 9)) {
            TryRead::Direct(view) => view,
            _ => panic!("expected hit"),
        };

        cache.mark_for_deletion(key);
        // still resident while pinned
        assert!(cache.piece_state(key).is_some());

        drop(view);
        assert_eq!(cache.piece_state(key), None);
    }

    #[test]
    fn test_pin_reasons_balance() {
        let cache = make_cache(64);
        let key = PieceKey::new(1, 0);
        cache.add_dirty_block(key, 0, block(&cache, 1), 1, 7);

        let job = cache.next_flush_job().expect("flush job");
        assert_eq!(cache.block_pin_reasons(key, 0), Some([0, 0, 1]));
        cache.blocks_flushed(key, &job.blocks.iter().map(|(i, _)| *i).collect::<Vec<_>>());
        assert_eq!(cache.block_pin_reasons(key, 0), Some([0, 0, 0]));

        let view = match cache.try_read(&read_req(key, 0, 1024, 9)) {
            TryRead::Direct(view) => view,
            _ => panic!("expected hit"),
        };
        assert_eq!(cache.block_pin_reasons(key, 0), Some([0, 1, 0]));
        drop(view);
        assert_eq!(cache.block_pin_reasons(key, 0), Some([0, 0, 0]));
        assert!(cache.block_hits(key, 0).unwrap_or(0) >= 2);
    }

    #[test]
    fn test_pool_budget_is_returned_on_eviction() {
        let cache = make_cache(8);
        let pool_used_before = cache.pool().in_use();
        for piece in 0..4 {
            flushed_piece(&cache, PieceKey::new(1, piece), 7);
        }
        assert_eq!(cache.pool().in_use(), pool_used_before + 4);

        assert_eq!(cache.try_evict_blocks(4), 0);
        assert_eq!(cache.pool().in_use(), pool_used_before);
    }
}

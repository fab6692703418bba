//! Block caching for piece serving and receiving.
//!
//! [`BlockCache`] is an ARC-variant piece/block cache with pinning,
//! deferred eviction and dirty flushing; [`BufferPool`] is the block
//! buffer budget behind it and behind piece-payload receive buffers.

mod block_cache;
mod buffer_pool;

pub use block_cache::{
    BlockCache, BlockRef, CacheState, CacheStats, FlushJob, PieceKey, PinReason, ReadRequest,
    RequesterId, StorageId, TryRead, NUM_LISTS,
};
pub use buffer_pool::BufferPool;

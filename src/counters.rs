//! Monotonic performance counters.
//!
//! Counters are plain atomics updated from wherever the event happens and
//! read by whoever cares. Per-peer statistics are reduced into these on the
//! peer's one-second tick rather than mutated globally on every event.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Counter identifiers.
///
/// The discriminant doubles as the index into the counter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    // peers by direction and state
    NumPeersConnected = 0,
    NumPeersHalfOpen,
    NumPeersUpInterested,
    NumPeersDownInterested,
    NumPeersUpUnchoked,
    NumPeersDownUnchoked,
    NumPeersUpRequests,
    NumPeersDownRequests,

    // incoming request handling
    PieceRequests,
    InvalidPieceRequests,
    ChokedPieceRequests,
    MaxPieceRequests,

    // piece pick reasons
    PiecePicks,
    EndGamePiecePicks,
    RejectPiecePicks,
    SnubbedPiecePicks,
    UnchokePiecePicks,
    IncomingPiecePicks,

    // wasted payload, by reason
    WasteBytesTimedOut,
    WasteBytesCancelled,
    WasteBytesEndgame,
    WasteBytesUnknown,

    // transfer totals
    PayloadBytesDown,
    PayloadBytesUp,
    ProtocolBytesDown,
    ProtocolBytesUp,

    // disk and cache
    DiskQueueBytes,
    DiskReadFailures,
    ReadCacheBlocks,
    WriteCacheBlocks,
    PinnedCacheBlocks,
    ArcWritePieces,
    ArcVolatilePieces,
    ArcLru1Pieces,
    ArcLru1GhostPieces,
    ArcLru2Pieces,
    ArcLru2GhostPieces,

    // error taxonomy
    ErrorIncomingPeers,
    ConnectionReset,
    ConnectionEof,
    ConnectionRefused,
    ConnectionAborted,
    ConnectionTimedOut,
    BannedPeers,
}

const NUM_COUNTERS: usize = Counter::BannedPeers as usize + 1;

/// A table of monotonic counters.
///
/// `inc`/`add` may be called from any thread. A negative `add` is allowed
/// for gauges (peer counts, cache sizes); totals only ever grow.
pub struct Counters {
    table: [AtomicI64; NUM_COUNTERS],
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: [0i64; NUM_COUNTERS].map(AtomicI64::new),
        })
    }

    pub fn inc(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, value: i64) {
        self.table[counter as usize].fetch_add(value, Ordering::Relaxed);
    }

    pub fn set(&self, counter: Counter, value: i64) {
        self.table[counter as usize].store(value, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> i64 {
        self.table[counter as usize].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = Counters::new();
        assert_eq!(counters.get(Counter::PieceRequests), 0);

        counters.inc(Counter::PieceRequests);
        counters.add(Counter::PieceRequests, 2);
        assert_eq!(counters.get(Counter::PieceRequests), 3);

        counters.add(Counter::NumPeersConnected, 1);
        counters.add(Counter::NumPeersConnected, -1);
        assert_eq!(counters.get(Counter::NumPeersConnected), 0);
    }
}

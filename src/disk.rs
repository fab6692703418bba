//! Disk worker interface and completion routing.
//!
//! The engine core never blocks on file I/O. Received blocks go into the
//! block cache as dirty entries and a flush worker writes them out in the
//! background; reads for upload serving and piece hashing run on the
//! blocking pool. Completions re-enter the peer task through an mpsc
//! queue, each carrying the peer's liveness token: completions that arrive
//! after disconnect drop their effect silently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::cache::{BlockCache, PieceKey, StorageId};
use crate::picker::{BlockCoord, BlockRequest};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// The requested range does not exist on this storage.
    #[error("piece not found")]
    NotFound,

    /// Fewer bytes than requested were available.
    #[error("short read")]
    ShortRead,

    /// The disk buffer budget is exhausted.
    #[error("out of disk buffers")]
    OutOfBuffers,

    /// Underlying I/O failure.
    #[error("disk i/o failure: {0}")]
    Io(String),
}

/// Blocking storage operations, called from disk workers only.
pub trait DiskIo: Send + Sync + 'static {
    fn read(&self, storage: StorageId, piece: u32, offset: u32, buf: &mut [u8])
        -> Result<(), DiskError>;

    fn write(&self, storage: StorageId, piece: u32, offset: u32, data: &[u8])
        -> Result<(), DiskError>;

    fn hash(&self, storage: StorageId, piece: u32) -> Result<[u8; 20], DiskError>;
}

/// Per-peer liveness token.
///
/// Cloned into every async completion; revoked on disconnect so stale
/// completions are dropped instead of mutating a dead peer's state.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// A completion posted back to the peer task.
#[derive(Debug)]
pub enum DiskEvent {
    /// A received block reached the platter (or failed to).
    WriteDone {
        coord: BlockCoord,
        result: Result<(), DiskError>,
    },
    /// A read for upload serving completed.
    ReadDone {
        request: BlockRequest,
        result: Result<Bytes, DiskError>,
    },
    /// A piece hash completed.
    HashDone {
        piece: u32,
        result: Result<[u8; 20], DiskError>,
    },
}

pub type DiskEventSender = mpsc::UnboundedSender<DiskEvent>;
pub type DiskEventReceiver = mpsc::UnboundedReceiver<DiskEvent>;

struct PendingWrite {
    coord: BlockCoord,
    tx: DiskEventSender,
    liveness: Liveness,
}

/// Handle through which peers schedule disk work.
pub struct DiskHandle {
    io: Arc<dyn DiskIo>,
    cache: Arc<BlockCache>,
    /// Write completions waiting for their block to be flushed.
    pending_writes: Mutex<HashMap<(PieceKey, u32), Vec<PendingWrite>>>,
    dirty: Notify,
    shutdown: AtomicBool,
}

impl DiskHandle {
    pub fn new(io: Arc<dyn DiskIo>, cache: Arc<BlockCache>) -> Arc<Self> {
        let handle = Arc::new(Self {
            io,
            cache,
            pending_writes: Mutex::new(HashMap::new()),
            dirty: Notify::new(),
            shutdown: AtomicBool::new(false),
        });
        tokio::spawn(Self::run_flusher(Arc::clone(&handle)));
        handle
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.dirty.notify_waiters();
    }

    /// Queues a received block: into the cache as dirty, flushed in the
    /// background. The completion is posted once the block is on disk.
    pub fn async_write(
        &self,
        key: PieceKey,
        coord: BlockCoord,
        data: Bytes,
        blocks_in_piece: u32,
        requester: usize,
        tx: DiskEventSender,
        liveness: Liveness,
    ) {
        let installed = self
            .cache
            .add_dirty_block(key, coord.block, data, blocks_in_piece, requester);
        if !installed {
            // the block is already resident (and on disk or on its way);
            // complete right away
            if liveness.is_live() {
                let _ = tx.send(DiskEvent::WriteDone {
                    coord,
                    result: Ok(()),
                });
            }
            return;
        }
        self.pending_writes
            .lock()
            .entry((key, coord.block))
            .or_default()
            .push(PendingWrite {
                coord,
                tx,
                liveness,
            });
        self.dirty.notify_one();
    }

    /// Reads a range for upload serving. The result is inserted into the
    /// cache (so the next request hits) and posted back.
    pub fn async_read(
        self: &Arc<Self>,
        key: PieceKey,
        request: BlockRequest,
        blocks_in_piece: u32,
        requester: usize,
        volatile_read: bool,
        tx: DiskEventSender,
        liveness: Liveness,
    ) {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let block_size = this.cache.pool().block_size() as u32;
            let block = request.start / block_size;
            let block_offset = block * block_size;

            let result = match this.cache.pool().try_alloc() {
                None => Err(DiskError::OutOfBuffers),
                Some(mut buf) => {
                    // read the whole containing block so the cache gains a
                    // full entry, then slice the requested range out
                    buf.resize(block_size as usize, 0);
                    match this
                        .io
                        .read(key.storage, key.piece, block_offset, &mut buf)
                    {
                        Ok(()) => {
                            let full = buf.freeze();
                            this.cache.insert_blocks(
                                key,
                                block,
                                vec![full.clone()],
                                blocks_in_piece,
                                requester,
                                volatile_read,
                            );
                            let from = (request.start - block_offset) as usize;
                            let to = from + request.length as usize;
                            if to <= full.len() {
                                Ok(full.slice(from..to))
                            } else {
                                Err(DiskError::ShortRead)
                            }
                        }
                        Err(e) => {
                            this.cache.pool().free_mut(buf);
                            Err(e)
                        }
                    }
                }
            };

            if liveness.is_live() {
                let _ = tx.send(DiskEvent::ReadDone { request, result });
            }
        });
    }

    /// Hashes a whole piece on the blocking pool.
    pub fn async_hash(
        self: &Arc<Self>,
        storage: StorageId,
        piece: u32,
        tx: DiskEventSender,
        liveness: Liveness,
    ) {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let result = this.io.hash(storage, piece);
            if liveness.is_live() {
                let _ = tx.send(DiskEvent::HashDone { piece, result });
            }
        });
    }

    /// The background flush loop: drains the cache's dirty blocks in LRU
    /// order and posts write completions.
    async fn run_flusher(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            let Some(job) = self.cache.next_flush_job() else {
                let notified = self.dirty.notified();
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                notified.await;
                continue;
            };

            let this = Arc::clone(&self);
            let flushed = tokio::task::spawn_blocking(move || {
                let block_size = this.cache.pool().block_size() as u32;
                let mut done = Vec::with_capacity(job.blocks.len());
                let mut failed = Vec::new();
                for (block, data) in &job.blocks {
                    let offset = block * block_size;
                    match this.io.write(job.key.storage, job.key.piece, offset, data) {
                        Ok(()) => done.push(*block),
                        Err(e) => {
                            warn!(
                                storage = job.key.storage,
                                piece = job.key.piece,
                                block = *block,
                                error = %e,
                                "block flush failed"
                            );
                            failed.push((*block, e));
                        }
                    }
                }
                (this, job.key, done, failed)
            })
            .await;

            let Ok((this, key, done, failed)) = flushed else {
                continue;
            };

            // blocks that failed keep their dirty bit and retry later
            this.cache.blocks_flushed(key, &done);
            if !failed.is_empty() {
                let failed_blocks: Vec<u32> = failed.iter().map(|(b, _)| *b).collect();
                this.cache.flush_failed(key, &failed_blocks);
                // back off before retrying a failing device
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
            debug!(
                storage = key.storage,
                piece = key.piece,
                flushed = done.len(),
                "blocks flushed"
            );

            let mut pending = this.pending_writes.lock();
            for &block in &done {
                if let Some(waiters) = pending.remove(&(key, block)) {
                    for waiter in waiters {
                        if waiter.liveness.is_live() {
                            let _ = waiter.tx.send(DiskEvent::WriteDone {
                                coord: waiter.coord,
                                result: Ok(()),
                            });
                        }
                    }
                }
            }
            for (block, error) in failed {
                if let Some(waiters) = pending.remove(&(key, block)) {
                    for waiter in waiters {
                        if waiter.liveness.is_live() {
                            let _ = waiter.tx.send(DiskEvent::WriteDone {
                                coord: waiter.coord,
                                result: Err(error.clone()),
                            });
                        }
                    }
                }
            }
        }
    }
}

/// In-memory storage backend, for tests and for seeding from RAM.
pub struct MemoryDisk {
    pieces: Mutex<HashMap<(StorageId, u32), Vec<u8>>>,
    fail_reads: AtomicBool,
}

impl MemoryDisk {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pieces: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
        })
    }

    /// Pre-populates a piece, as verified content ready for serving.
    pub fn put_piece(&self, storage: StorageId, piece: u32, data: Vec<u8>) {
        self.pieces.lock().insert((storage, piece), data);
    }

    pub fn piece(&self, storage: StorageId, piece: u32) -> Option<Vec<u8>> {
        self.pieces.lock().get(&(storage, piece)).cloned()
    }

    /// Makes every subsequent read fail, to exercise error paths.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }
}

impl DiskIo for MemoryDisk {
    fn read(
        &self,
        storage: StorageId,
        piece: u32,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), DiskError> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(DiskError::Io("injected read failure".into()));
        }
        let pieces = self.pieces.lock();
        let data = pieces.get(&(storage, piece)).ok_or(DiskError::NotFound)?;
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            // partial trailing block: zero-fill the tail
            if offset >= data.len() {
                return Err(DiskError::ShortRead);
            }
            let avail = data.len() - offset;
            buf[..avail].copy_from_slice(&data[offset..]);
            buf[avail..].fill(0);
            return Ok(());
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write(
        &self,
        storage: StorageId,
        piece: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), DiskError> {
        let mut pieces = self.pieces.lock();
        let entry = pieces.entry((storage, piece)).or_default();
        let offset = offset as usize;
        if entry.len() < offset + data.len() {
            entry.resize(offset + data.len(), 0);
        }
        entry[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn hash(&self, storage: StorageId, piece: u32) -> Result<[u8; 20], DiskError> {
        let pieces = self.pieces.lock();
        let data = pieces.get(&(storage, piece)).ok_or(DiskError::NotFound)?;
        let mut hasher = Sha1::new();
        hasher.update(data);
        Ok(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BufferPool;
    use crate::counters::Counters;

    fn handle() -> (Arc<DiskHandle>, Arc<MemoryDisk>) {
        let disk = MemoryDisk::new();
        let pool = BufferPool::new(16 * 1024, 256);
        let cache = BlockCache::new(64, 8, pool, Counters::new());
        (DiskHandle::new(disk.clone(), cache), disk)
    }

    #[tokio::test]
    async fn test_write_completion_arrives_after_flush() {
        let (handle, disk) = handle();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let data = Bytes::from(vec![7u8; 16 * 1024]);
        let key = PieceKey::new(1, 0);
        let coord = BlockCoord::new(0, 0);
        handle.async_write(key, coord, data, 1, 42, tx, Liveness::new());

        let event = rx.recv().await.expect("write completion");
        match event {
            DiskEvent::WriteDone { coord: c, result } => {
                assert_eq!(c, coord);
                assert!(result.is_ok());
            }
            other => panic!("expected write done, got {:?}", other),
        }
        assert_eq!(disk.piece(1, 0).map(|p| p.len()), Some(16 * 1024));
        handle.stop();
    }

    #[tokio::test]
    async fn test_revoked_liveness_drops_completion() {
        let (handle, _disk) = handle();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let liveness = Liveness::new();
        liveness.revoke();
        handle.async_write(
            PieceKey::new(1, 0),
            BlockCoord::new(0, 0),
            Bytes::from(vec![1u8; 1024]),
            1,
            42,
            tx,
            liveness,
        );

        // the flush happens, but no event is delivered
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        handle.stop();
    }

    #[tokio::test]
    async fn test_read_round_trip_populates_cache() {
        let (handle, disk) = handle();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let content: Vec<u8> = (0..32 * 1024u32).map(|i| (i % 251) as u8).collect();
        disk.put_piece(9, 3, content.clone());

        let key = PieceKey::new(9, 3);
        let request = BlockRequest::new(3, 16 * 1024, 1024);
        handle.async_read(key, request, 2, 42, false, tx, Liveness::new());

        match rx.recv().await.expect("read completion") {
            DiskEvent::ReadDone { request: r, result } => {
                assert_eq!(r, request);
                let data = result.expect("read ok");
                assert_eq!(&data[..], &content[16 * 1024..16 * 1024 + 1024]);
            }
            other => panic!("expected read done, got {:?}", other),
        }
        // the containing block is now resident
        assert_eq!(handle.cache().piece_counts(key), Some((1, 0)));
        handle.stop();
    }

    #[tokio::test]
    async fn test_read_failure_is_reported() {
        let (handle, disk) = handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        disk.set_fail_reads(true);
        disk.put_piece(1, 0, vec![0u8; 16 * 1024]);

        handle.async_read(
            PieceKey::new(1, 0),
            BlockRequest::new(0, 0, 1024),
            1,
            42,
            false,
            tx,
            Liveness::new(),
        );

        match rx.recv().await.expect("completion") {
            DiskEvent::ReadDone { result, .. } => assert!(result.is_err()),
            other => panic!("expected read done, got {:?}", other),
        }
        handle.stop();
    }

    #[tokio::test]
    async fn test_hash_matches_content() {
        let (handle, disk) = handle();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let content = vec![0xABu8; 4096];
        disk.put_piece(2, 7, content.clone());

        let expected: [u8; 20] = {
            let mut hasher = Sha1::new();
            hasher.update(&content);
            hasher.finalize().into()
        };

        handle.async_hash(2, 7, tx, Liveness::new());
        match rx.recv().await.expect("completion") {
            DiskEvent::HashDone { piece, result } => {
                assert_eq!(piece, 7);
                assert_eq!(result.expect("hash ok"), expected);
            }
            other => panic!("expected hash done, got {:?}", other),
        }
        handle.stop();
    }
}

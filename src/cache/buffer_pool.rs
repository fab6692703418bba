use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;

/// Pool of block-sized disk buffers with a hard budget.
///
/// Every cache block and every piece-payload tail buffer is accounted here.
/// When the budget is exhausted, allocation fails and the caller surfaces
/// an out-of-memory condition; when usage crosses the high watermark, peers
/// stop reading piece payloads until buffers are returned.
pub struct BufferPool {
    free: ArrayQueue<BytesMut>,
    block_size: usize,
    /// Maximum number of buffers outstanding.
    capacity: usize,
    in_use: AtomicUsize,
    /// Above this, socket reads of piece payloads are suspended.
    high_watermark: usize,
    released: Notify,
}

impl BufferPool {
    pub fn new(block_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(capacity.max(1)),
            block_size,
            capacity,
            in_use: AtomicUsize::new(0),
            high_watermark: capacity - capacity / 8,
            released: Notify::new(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Allocates one block buffer, or `None` when the budget is spent.
    pub fn try_alloc(&self) -> Option<BytesMut> {
        let mut current = self.in_use.load(Ordering::Relaxed);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Some(
            self.free
                .pop()
                .unwrap_or_else(|| BytesMut::with_capacity(self.block_size)),
        )
    }

    /// Returns a mutable buffer to the pool.
    pub fn free_mut(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.free.push(buf);
        self.release_one();
    }

    /// Returns a frozen buffer. The allocation is released immediately; the
    /// backing memory is recycled only if no other handle shares it.
    pub fn free(&self, buf: Bytes) {
        if let Ok(mut owned) = buf.try_into_mut() {
            owned.clear();
            let _ = self.free.push(owned);
        }
        self.release_one();
    }

    fn release_one(&self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_waiters();
    }

    /// The disk back-pressure flag.
    pub fn exceeds_watermark(&self) -> bool {
        self.in_use() >= self.high_watermark
    }

    /// Waits until usage drops below the high watermark.
    pub async fn below_watermark(&self) {
        while self.exceeds_watermark() {
            let notified = self.released.notified();
            if !self.exceeds_watermark() {
                return;
            }
            notified.await;
        }
    }
}

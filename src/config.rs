//! Engine settings.
//!
//! A single flat settings struct shared by the peer layer, the request
//! pipeline, the upload server and the block cache. Defaults follow what
//! mature clients ship with; everything is overridable per session.

use std::time::Duration;

/// Standard block size (16 KiB), the transfer unit of the protocol.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Largest post-handshake packet we accept. Anything bigger is a protocol
/// violation and terminates the connection.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Target latency for the outgoing request queue. The desired queue
    /// depth is `request_queue_time * download_rate / block_size`.
    pub request_queue_time: Duration,
    /// Lower bound on the desired request queue depth.
    pub min_request_queue: usize,
    /// Upper bound on the desired request queue depth.
    pub max_out_request_queue: usize,
    /// Base timeout for an outstanding block request.
    pub request_timeout: Duration,
    /// Timeout for receiving any part of a piece once one is in flight.
    pub piece_timeout: Duration,
    /// Coalesce contiguous blocks of the same piece into one request.
    pub request_large_blocks: bool,

    /// Cap on the remote's incoming request queue; requests beyond it are
    /// rejected.
    pub max_allowed_in_request_queue: usize,
    /// Invalid requests tolerated before the peer is disconnected.
    pub max_invalid_requests: u32,
    /// Number of pieces handed out in the allowed-fast set.
    pub allowed_fast_set_size: usize,

    /// General peer inactivity timeout.
    pub peer_timeout: Duration,
    /// How long a connection may sit in the handshake phase.
    pub handshake_timeout: Duration,
    /// Mutual disinterest tolerated before a policy disconnect.
    pub inactivity_timeout: Duration,
    /// How long an unchoked, interested peer may go without requesting
    /// anything before a seed drops it.
    pub no_request_timeout: Duration,

    /// Block cache capacity, in blocks.
    pub cache_size: usize,
    /// Consecutive failed disk reads tolerated before dropping a peer.
    pub max_disk_read_failures: u32,
    /// Stop filling the send buffer above this many queued bytes.
    pub send_buffer_watermark: usize,
}

impl Settings {
    /// Bound on each ghost list, derived from the configured cache size.
    pub fn ghost_size(&self) -> usize {
        (self.cache_size / 16).max(8)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_queue_time: Duration::from_secs(3),
            min_request_queue: 2,
            max_out_request_queue: 500,
            request_timeout: Duration::from_secs(60),
            piece_timeout: Duration::from_secs(20),
            request_large_blocks: false,
            max_allowed_in_request_queue: 500,
            max_invalid_requests: 300,
            allowed_fast_set_size: 10,
            peer_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(600),
            no_request_timeout: Duration::from_secs(60),
            cache_size: 1024,
            max_disk_read_failures: 100,
            send_buffer_watermark: 500 * 1024,
        }
    }
}

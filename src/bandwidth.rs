//! Quota-driven bandwidth channels.
//!
//! Every socket read and write asks for a byte grant before touching the
//! transport. Grants traverse a hierarchy of channels: the peer's own
//! channel, its torrent's channel and the session channel; the transfer
//! proceeds only once every level has granted. Quota refills continuously
//! (token bucket with burst headroom), so a direction that ran dry simply
//! suspends until the bucket has refilled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Transfer direction a channel meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

/// One quota channel: a token bucket over bytes.
///
/// The bucket holds up to two seconds of quota so short bursts don't pay
/// latency, and it may go negative when a grant overshoots, which charges
/// the overshoot to the next refill interval.
pub struct BandwidthChannel {
    bucket: Mutex<TokenBucket>,
}

impl BandwidthChannel {
    /// A channel limited to `bytes_per_sec`. Zero means unlimited.
    pub fn new(bytes_per_sec: u64) -> Arc<Self> {
        if bytes_per_sec == 0 {
            return Self::unlimited();
        }
        let max_tokens = (bytes_per_sec * 2) as f64;
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: max_tokens,
                max_tokens,
                tokens_per_sec: bytes_per_sec as f64,
                last_update: Instant::now(),
            }),
        })
    }

    /// A channel that always grants immediately.
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: f64::MAX,
                max_tokens: f64::MAX,
                tokens_per_sec: f64::MAX,
                last_update: Instant::now(),
            }),
        })
    }

    /// Updates the rate limit in place.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        if bytes_per_sec == 0 {
            bucket.tokens = f64::MAX;
            bucket.max_tokens = f64::MAX;
            bucket.tokens_per_sec = f64::MAX;
            return;
        }
        bucket.tokens_per_sec = bytes_per_sec as f64;
        bucket.max_tokens = (bytes_per_sec * 2) as f64;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    /// Deducts `bytes` of quota and returns how long the caller must wait
    /// before using it.
    fn request(&self, bytes: usize) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.last_update = now;

        bucket.tokens = (bucket.tokens + elapsed * bucket.tokens_per_sec).min(bucket.max_tokens);

        let bytes_f = bytes as f64;
        if bucket.tokens >= bytes_f {
            bucket.tokens -= bytes_f;
            Duration::ZERO
        } else {
            let needed = bytes_f - bucket.tokens;
            let wait_secs = needed / bucket.tokens_per_sec;
            bucket.tokens = 0.0;
            Duration::from_secs_f64(wait_secs)
        }
    }

    /// Returns unused quota from an over-sized grant.
    pub fn refund(&self, bytes: usize) {
        let mut bucket = self.bucket.lock();
        bucket.tokens = (bucket.tokens + bytes as f64).min(bucket.max_tokens);
    }

    /// Quota currently available, in bytes.
    pub fn available(&self) -> usize {
        let bucket = self.bucket.lock();
        if bucket.tokens >= usize::MAX as f64 {
            usize::MAX
        } else {
            bucket.tokens.max(0.0) as usize
        }
    }
}

/// The session-scope gate. Peer- and torrent-scope channels are created by
/// their owners and passed into [`BandwidthGate::acquire`].
pub struct BandwidthGate {
    session_down: Arc<BandwidthChannel>,
    session_up: Arc<BandwidthChannel>,
}

impl BandwidthGate {
    /// Session limits in bytes per second; zero means unlimited.
    pub fn new(down_limit: u64, up_limit: u64) -> Arc<Self> {
        Arc::new(Self {
            session_down: BandwidthChannel::new(down_limit),
            session_up: BandwidthChannel::new(up_limit),
        })
    }

    pub fn session_channel(&self, direction: Direction) -> &Arc<BandwidthChannel> {
        match direction {
            Direction::Down => &self.session_down,
            Direction::Up => &self.session_up,
        }
    }

    /// Acquires `bytes` of quota through the whole hierarchy: the given
    /// peer/torrent channels plus the session channel. Suspends until
    /// every level has granted.
    pub async fn acquire(
        &self,
        direction: Direction,
        channels: &[&BandwidthChannel],
        bytes: usize,
    ) {
        let mut wait = self.session_channel(direction).request(bytes);
        for channel in channels {
            wait = wait.max(channel.request(bytes));
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Returns quota that was granted but not consumed by the transfer.
    pub fn refund(&self, direction: Direction, channels: &[&BandwidthChannel], bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.session_channel(direction).refund(bytes);
        for channel in channels {
            channel.refund(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_channel_always_grants() {
        let channel = BandwidthChannel::unlimited();
        assert_eq!(channel.request(usize::MAX / 2), Duration::ZERO);
        assert_eq!(channel.request(usize::MAX / 2), Duration::ZERO);
    }

    #[test]
    fn test_limited_channel_meters() {
        let channel = BandwidthChannel::new(1000);
        // burst headroom is 2x the rate
        assert_eq!(channel.request(2000), Duration::ZERO);
        let wait = channel.request(1000);
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_millis(1100));
    }

    #[test]
    fn test_refund_restores_quota() {
        let channel = BandwidthChannel::new(1000);
        assert_eq!(channel.request(2000), Duration::ZERO);
        channel.refund(1500);
        assert!(channel.available() >= 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hierarchy_takes_slowest_grant() {
        let gate = BandwidthGate::new(0, 0);
        let torrent = BandwidthChannel::new(1000);
        let peer = BandwidthChannel::unlimited();
        let channels = [torrent.as_ref(), peer.as_ref()];

        // drain the torrent channel's burst
        gate.acquire(Direction::Down, &channels, 2000).await;

        let before = tokio::time::Instant::now();
        gate.acquire(Direction::Down, &channels, 500).await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(400), "waited {:?}", waited);
    }

    #[tokio::test]
    async fn test_session_limit_applies_without_extra_channels() {
        let gate = BandwidthGate::new(0, 1_000_000);
        gate.acquire(Direction::Up, &[], 1024).await;
        gate.refund(Direction::Up, &[], 512);
    }
}

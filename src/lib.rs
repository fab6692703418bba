//! btcore - BitTorrent engine core
//!
//! This library implements the two central pieces of a BitTorrent engine:
//! the per-peer wire protocol state machine and the block-level disk cache
//! that backs piece serving.
//!
//! # Modules
//!
//! - [`peer`] - Peer wire protocol: framing, handshake, message dispatch,
//!   request pipelining, upload serving
//! - [`cache`] - ARC-style block cache with pinning and deferred eviction
//! - [`bandwidth`] - Quota-driven bandwidth channels for socket I/O
//! - [`bencode`] - Bencode support for the extended handshake
//! - [`disk`] - Disk worker interface and completion routing
//! - [`picker`] - The piece picker interface the peer consumes
//! - [`torrent`] - Shared per-torrent context and peer membership
//! - [`alert`] - Structured event emission
//! - [`counters`] - Monotonic performance counters
//!
//! Everything else a full client needs (trackers, DHT, port mapping, file
//! format parsing) is an external collaborator and lives outside this crate.

pub mod alert;
pub mod bandwidth;
pub mod bencode;
pub mod cache;
pub mod config;
pub mod counters;
pub mod disk;
pub mod peer;
pub mod picker;
pub mod torrent;

pub use alert::{Alert, AlertSink, ChannelSink};
pub use bandwidth::{BandwidthChannel, BandwidthGate};
pub use bencode::{decode, encode, BencodeError, Value};
pub use cache::{BlockCache, BufferPool, CacheState, PieceKey, TryRead};
pub use config::Settings;
pub use counters::{Counter, Counters};
pub use disk::{DiskError, DiskHandle, DiskIo, Liveness, MemoryDisk};
pub use peer::{
    Bitfield, Framer, Handshake, Message, PeerConnection, PeerError, PeerId, Severity, WireEvent,
};
pub use picker::{BlockCoord, BlockRequest, PickHints, PiecePicker, RequestTracker};
pub use torrent::{InfoHash, Torrent, TorrentBuilder, TorrentRegistry};

//! Shared per-torrent context.
//!
//! A [`Torrent`] owns the things all its peers share: piece geometry, the
//! bitfield of owned pieces, the picker, the disk handle, the alert sink
//! and the peer membership set. Peers hold an `Arc` to this context; the
//! context never holds peers back (membership is identity-only), so there
//! is no ownership cycle. Inbound connections resolve their info-hash
//! through the [`TorrentRegistry`].

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::alert::AlertSink;
use crate::bandwidth::{BandwidthChannel, Direction};
use crate::cache::{PieceKey, StorageId};
use crate::config::Settings;
use crate::counters::Counters;
use crate::disk::DiskHandle;
use crate::peer::Bitfield;
use crate::picker::{BlockCoord, PeerKey, PiecePicker};

/// A torrent's 20-byte identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 20 {
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(bytes);
        Some(Self(hash))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

/// Construction parameters for a [`Torrent`].
pub struct TorrentBuilder {
    pub info_hash: InfoHash,
    pub storage: StorageId,
    pub piece_count: u32,
    pub piece_length: u32,
    pub total_length: u64,
    pub block_size: u32,
    pub settings: Arc<Settings>,
    pub picker: Box<dyn PiecePicker>,
    pub disk: Arc<DiskHandle>,
    pub alerts: Arc<dyn AlertSink>,
    pub counters: Arc<Counters>,
    /// Start with all pieces (a seed).
    pub seed: bool,
    /// Expected per-piece SHA-1 digests. When absent, hash completions
    /// are accepted as-is (the embedder verifies).
    pub piece_hashes: Option<Vec<[u8; 20]>>,
}

impl TorrentBuilder {
    pub fn build(self) -> Arc<Torrent> {
        let have = if self.seed {
            Bitfield::full(self.piece_count as usize)
        } else {
            Bitfield::new(self.piece_count as usize)
        };
        Arc::new(Torrent {
            info_hash: self.info_hash,
            storage: self.storage,
            piece_count: self.piece_count,
            piece_length: self.piece_length,
            total_length: self.total_length,
            block_size: self.block_size,
            settings: self.settings,
            have: RwLock::new(have),
            predictive: RwLock::new(HashSet::new()),
            picker: Mutex::new(self.picker),
            disk: self.disk,
            alerts: self.alerts,
            counters: self.counters,
            peers: Mutex::new(HashSet::new()),
            superseeding: AtomicBool::new(false),
            down_channel: BandwidthChannel::unlimited(),
            up_channel: BandwidthChannel::unlimited(),
            next_peer_seq: AtomicU64::new(1),
            piece_hashes: self.piece_hashes,
        })
    }
}

/// The shared context of one torrent.
pub struct Torrent {
    info_hash: InfoHash,
    storage: StorageId,
    piece_count: u32,
    piece_length: u32,
    total_length: u64,
    block_size: u32,
    settings: Arc<Settings>,
    have: RwLock<Bitfield>,
    /// Pieces announced before verification completed. Requests for them
    /// queue instead of being rejected.
    predictive: RwLock<HashSet<u32>>,
    picker: Mutex<Box<dyn PiecePicker>>,
    disk: Arc<DiskHandle>,
    alerts: Arc<dyn AlertSink>,
    counters: Arc<Counters>,
    peers: Mutex<HashSet<PeerKey>>,
    superseeding: AtomicBool,
    down_channel: Arc<BandwidthChannel>,
    up_channel: Arc<BandwidthChannel>,
    next_peer_seq: AtomicU64,
    piece_hashes: Option<Vec<[u8; 20]>>,
}

impl Torrent {
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn storage(&self) -> StorageId {
        self.storage
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_count
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn disk(&self) -> &Arc<DiskHandle> {
        &self.disk
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn bandwidth_channel(&self, direction: Direction) -> &Arc<BandwidthChannel> {
        match direction {
            Direction::Down => &self.down_channel,
            Direction::Up => &self.up_channel,
        }
    }

    /// Byte length of a given piece; only the last piece may be short.
    pub fn piece_size(&self, piece: u32) -> u32 {
        if self.piece_count == 0 {
            return 0;
        }
        if piece + 1 < self.piece_count {
            return self.piece_length;
        }
        let remainder = self.total_length % self.piece_length as u64;
        if remainder == 0 {
            self.piece_length
        } else {
            remainder as u32
        }
    }

    pub fn blocks_in_piece(&self, piece: u32) -> u32 {
        self.piece_size(piece).div_ceil(self.block_size)
    }

    /// Byte length of a block, capped by the piece end.
    pub fn block_len(&self, block: BlockCoord) -> u32 {
        let piece_size = self.piece_size(block.piece);
        let offset = block.block * self.block_size;
        piece_size.saturating_sub(offset).min(self.block_size)
    }

    pub fn piece_key(&self, piece: u32) -> PieceKey {
        PieceKey::new(self.storage, piece)
    }

    pub fn have_bitfield(&self) -> Bitfield {
        self.have.read().clone()
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.have.read().has_piece(piece as usize)
    }

    pub fn have_count(&self) -> usize {
        self.have.read().count()
    }

    pub fn is_seed(&self) -> bool {
        self.have.read().is_complete()
    }

    /// Records a verified piece.
    pub fn set_have(&self, piece: u32) {
        self.have.write().set_piece(piece as usize);
        self.predictive.write().remove(&piece);
    }

    /// Announces a piece before its hash has been verified. Incoming
    /// requests for it are queued rather than rejected.
    pub fn add_predictive_piece(&self, piece: u32) {
        self.predictive.write().insert(piece);
    }

    pub fn is_predictive_piece(&self, piece: u32) -> bool {
        self.predictive.read().contains(&piece)
    }

    /// Compares a computed digest against the expected piece hash.
    /// Without stored hashes, the digest is trusted.
    pub fn verify_piece(&self, piece: u32, digest: &[u8; 20]) -> bool {
        match &self.piece_hashes {
            Some(hashes) => hashes.get(piece as usize).map(|h| h == digest).unwrap_or(false),
            None => true,
        }
    }

    /// Resolves a predictive announcement after verification.
    pub fn resolve_predictive_piece(&self, piece: u32, passed: bool) {
        self.predictive.write().remove(&piece);
        if passed {
            self.have.write().set_piece(piece as usize);
        }
    }

    /// Runs `f` with the piece picker locked.
    pub fn with_picker<R>(&self, f: impl FnOnce(&mut dyn PiecePicker) -> R) -> R {
        let mut picker = self.picker.lock();
        f(picker.as_mut())
    }

    pub fn superseeding(&self) -> bool {
        self.superseeding.load(Ordering::Acquire)
    }

    pub fn set_superseeding(&self, on: bool) {
        self.superseeding.store(on, Ordering::Release);
    }

    /// Picks a piece to superseed to a peer: one we have, the peer lacks,
    /// and that isn't already assigned to it.
    pub fn next_superseed_piece(&self, exclude: &[u32], peer_has: &Bitfield) -> Option<u32> {
        let have = self.have.read();
        (0..self.piece_count).find(|&piece| {
            have.has_piece(piece as usize)
                && !peer_has.has_piece(piece as usize)
                && !exclude.contains(&piece)
        })
    }

    /// Registers a peer in the membership set, assigning its key.
    pub fn attach_peer(&self) -> PeerKey {
        let key = PeerKey(self.next_peer_seq.fetch_add(1, Ordering::Relaxed));
        self.peers.lock().insert(key);
        key
    }

    pub fn remove_peer(&self, key: PeerKey) {
        self.peers.lock().remove(&key);
    }

    pub fn num_peers(&self) -> usize {
        self.peers.lock().len()
    }
}

/// Lookup table from info-hash to torrent, used to attach inbound peers.
#[derive(Default)]
pub struct TorrentRegistry {
    torrents: DashMap<InfoHash, Arc<Torrent>>,
}

impl TorrentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, torrent: Arc<Torrent>) {
        self.torrents.insert(torrent.info_hash(), torrent);
    }

    pub fn find(&self, info_hash: &InfoHash) -> Option<Arc<Torrent>> {
        self.torrents.get(info_hash).map(|t| Arc::clone(&t))
    }

    /// Removes the torrent and drops its cached pieces.
    pub fn remove(&self, info_hash: &InfoHash) -> Option<Arc<Torrent>> {
        let (_, torrent) = self.torrents.remove(info_hash)?;
        torrent.disk().cache().remove_storage(torrent.storage());
        Some(torrent)
    }

    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }
}

//! The peer connection: wire state machine, lifecycle and I/O driver.
//!
//! A `PeerConnection` owns one remote peer: its handshake progress, the
//! mirrored protocol state (choke/interest both ways, the remote
//! bitfield), the outgoing request pipeline, the incoming upload queue
//! and the send buffer. Message handling is synchronous and socket-free,
//! which keeps the state machine testable; [`PeerConnection::run`] is the
//! async driver that pumps a socket through the framer and the bandwidth
//! gate.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::bitfield::Bitfield;
use super::error::{Operation, PeerError, Severity};
use super::extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID};
use super::fast::FastState;
use super::framer::{Framer, WireEvent};
use super::handshake::{Handshake, VERSION_BANNER};
use super::message::Message;
use super::peer_id::PeerId;
use super::request::RequestPipeline;
use super::stats::TransferStats;
use super::upload::UploadQueue;
use crate::alert::{Alert, AlertSink};
use crate::bandwidth::{BandwidthGate, Direction};
use crate::cache::BlockRef;
use crate::config::Settings;
use crate::counters::{Counter, Counters};
use crate::disk::{DiskError, DiskEvent, DiskEventReceiver, DiskEventSender, Liveness};
use crate::picker::{BlockCoord, BlockRequest, PeerKey};
use crate::torrent::{Torrent, TorrentRegistry};

/// How much read quota is requested per socket read.
const READ_QUOTUM: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Handshaking,
    Connected,
    Disconnected,
}

/// Feature flags taken from the remote's reserved bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteCaps {
    pub extension_protocol: bool,
    pub dht_port: bool,
    pub fast_extension: bool,
}

impl RemoteCaps {
    fn from_reserved(reserved: &[u8; 8]) -> Self {
        Self {
            extension_protocol: reserved[5] & 0x10 != 0,
            dht_port: reserved[7] & 0x01 != 0,
            fast_extension: reserved[7] & 0x04 != 0,
        }
    }
}

/// Why and how a peer went away.
#[derive(Debug, Clone)]
pub struct DisconnectRecord {
    pub operation: Operation,
    pub severity: Severity,
    pub reason: String,
}

enum Region {
    Plain(Bytes),
    /// A zero-copy cache block; the pin is released when the region is
    /// fully written out.
    Pinned { data: Bytes, _pin: BlockRef },
}

impl Region {
    fn data(&self) -> &Bytes {
        match self {
            Region::Plain(data) => data,
            Region::Pinned { data, .. } => data,
        }
    }

    fn data_mut(&mut self) -> &mut Bytes {
        match self {
            Region::Plain(data) => data,
            Region::Pinned { data, .. } => data,
        }
    }
}

/// Chained outgoing byte regions. Cache-backed regions carry their pin
/// and release it on completion.
#[derive(Default)]
pub struct SendBuffer {
    regions: VecDeque<Region>,
    len: usize,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.regions.push_back(Region::Plain(data));
    }

    pub fn push_pinned(&mut self, data: Bytes, pin: BlockRef) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.regions.push_back(Region::Pinned { data, _pin: pin });
    }

    /// The first unwritten chunk.
    pub fn front(&self) -> Option<&[u8]> {
        self.regions.front().map(|r| r.data().as_ref())
    }

    /// A cheap clone of the first unwritten chunk.
    pub fn front_bytes(&self) -> Option<Bytes> {
        self.regions.front().map(|r| r.data().clone())
    }

    /// Consumes `n` written bytes, dropping fully sent regions (which
    /// releases their pins).
    pub fn advance(&mut self, mut n: usize) {
        self.len -= n.min(self.len);
        while n > 0 {
            let Some(front) = self.regions.front_mut() else {
                return;
            };
            let available = front.data().len();
            if n >= available {
                n -= available;
                self.regions.pop_front();
            } else {
                front.data_mut().advance(n);
                return;
            }
        }
    }
}

/// A connection-scoped peer.
pub struct PeerConnection {
    pub(crate) addr: SocketAddr,
    pub(crate) outbound: bool,
    pub(crate) state: ConnState,
    pub(crate) local_peer_id: PeerId,
    pub(crate) remote_peer_id: Option<PeerId>,

    pub(crate) registry: Option<Arc<TorrentRegistry>>,
    pub(crate) torrent: Option<Arc<Torrent>>,
    pub(crate) key: Option<PeerKey>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) alerts: Arc<dyn AlertSink>,
    pub(crate) liveness: Liveness,
    pub(crate) disk_tx: DiskEventSender,
    disk_rx: Option<DiskEventReceiver>,

    pub(crate) framer: Framer,
    pub(crate) send_buffer: SendBuffer,
    pub(crate) caps: RemoteCaps,
    pub(crate) extension_handshake: Option<ExtensionHandshake>,
    pub(crate) remote_dht_port: Option<u16>,
    pub(crate) local_dht_port: Option<u16>,
    pub(crate) remote_bitfield: Option<Bitfield>,
    pub(crate) bitfield_received: bool,
    pub(crate) remote_have_count: usize,
    pub(crate) upload_only_remote: bool,

    pub(crate) am_choking: bool,
    pub(crate) am_interested: bool,
    pub(crate) peer_choking: bool,
    pub(crate) peer_interested: bool,
    pub(crate) on_parole: bool,

    pub(crate) fast: FastState,
    pub(crate) suggest_sent: Option<Bitfield>,
    pub(crate) pipeline: RequestPipeline,
    pub(crate) uploads: UploadQueue,
    pub(crate) stats: TransferStats,

    pub(crate) connected_at: Instant,
    pub(crate) last_receive: Instant,
    pub(crate) last_sent: Instant,
    pub(crate) last_piece: Instant,
    pub(crate) last_request: Instant,
    pub(crate) last_unchoke: Instant,
    pub(crate) last_incoming_request: Instant,
    pub(crate) last_choke: Instant,

    pub(crate) disk_read_failures: u32,
    pub(crate) max_out_request_queue: usize,
    pub(crate) disconnect_record: Option<DisconnectRecord>,
    /// Set when a version probe was answered; the connection only drains
    /// its banner and closes.
    banner_only: bool,
}

impl PeerConnection {
    fn new(
        addr: SocketAddr,
        outbound: bool,
        local_peer_id: PeerId,
        settings: Arc<Settings>,
        counters: Arc<Counters>,
        alerts: Arc<dyn AlertSink>,
        registry: Option<Arc<TorrentRegistry>>,
    ) -> Self {
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let min_queue = settings.min_request_queue;
        let max_queue = settings.max_out_request_queue;
        Self {
            addr,
            outbound,
            state: ConnState::Handshaking,
            local_peer_id,
            remote_peer_id: None,
            registry,
            torrent: None,
            key: None,
            settings,
            counters,
            alerts,
            liveness: Liveness::new(),
            disk_tx,
            disk_rx: Some(disk_rx),
            framer: Framer::new(),
            send_buffer: SendBuffer::new(),
            caps: RemoteCaps::default(),
            extension_handshake: None,
            remote_dht_port: None,
            local_dht_port: None,
            remote_bitfield: None,
            bitfield_received: false,
            remote_have_count: 0,
            upload_only_remote: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            on_parole: false,
            fast: FastState::new(),
            suggest_sent: None,
            pipeline: RequestPipeline::new(min_queue),
            uploads: UploadQueue::new(),
            stats: TransferStats::new(),
            connected_at: now,
            last_receive: now,
            last_sent: now,
            last_piece: now,
            last_request: now,
            last_unchoke: now,
            last_incoming_request: now,
            last_choke: now,
            disk_read_failures: 0,
            max_out_request_queue: max_queue,
            disconnect_record: None,
            banner_only: false,
        }
    }

    /// An outgoing connection to a peer of a known torrent. The handshake
    /// goes out immediately.
    pub fn outbound(addr: SocketAddr, torrent: Arc<Torrent>, local_peer_id: PeerId) -> Self {
        let mut conn = Self::new(
            addr,
            true,
            local_peer_id,
            Arc::clone(torrent.settings()),
            Arc::clone(torrent.counters()),
            Arc::clone(torrent.alerts()),
            None,
        );
        conn.attach(torrent);
        conn.queue_handshake();
        conn
    }

    /// An accepted connection; the torrent is resolved from the incoming
    /// info-hash through the registry.
    pub fn inbound(
        addr: SocketAddr,
        registry: Arc<TorrentRegistry>,
        local_peer_id: PeerId,
        settings: Arc<Settings>,
        counters: Arc<Counters>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self::new(
            addr,
            false,
            local_peer_id,
            settings,
            counters,
            alerts,
            Some(registry),
        )
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_disconnecting(&self) -> bool {
        self.state == ConnState::Disconnected
    }

    pub fn torrent(&self) -> Option<&Arc<Torrent>> {
        self.torrent.as_ref()
    }

    pub fn peer_key(&self) -> Option<PeerKey> {
        self.key
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Number of pieces the remote has announced.
    pub fn remote_piece_count(&self) -> usize {
        self.remote_have_count
    }

    /// The listen port the remote announced in a dht-port message.
    pub fn remote_port(&self) -> Option<u16> {
        self.remote_dht_port
    }

    /// When we last put a request on the wire.
    pub fn last_request_time(&self) -> Instant {
        self.last_request
    }

    pub fn disconnect_record(&self) -> Option<&DisconnectRecord> {
        self.disconnect_record.as_ref()
    }

    pub fn set_on_parole(&mut self, on_parole: bool) {
        self.on_parole = on_parole;
    }

    pub fn set_local_dht_port(&mut self, port: u16) {
        self.local_dht_port = Some(port);
    }

    /// The ARC requester token: the peer's identity within the torrent.
    pub(crate) fn requester_token(&self) -> usize {
        self.key.map(|k| k.0 as usize).unwrap_or(0)
    }

    fn attach(&mut self, torrent: Arc<Torrent>) {
        self.settings = Arc::clone(torrent.settings());
        self.key = Some(torrent.attach_peer());
        self.max_out_request_queue = self.settings.max_out_request_queue;
        self.pipeline.desired_queue_size = self.settings.min_request_queue;
        self.torrent = Some(torrent);
    }

    /// Appends an encoded message to the send buffer.
    pub(crate) fn queue_message(&mut self, message: Message) {
        trace!(peer = %self.addr, ?message, "send");
        let encoded = message.encode();
        self.stats.sent_bytes(0, encoded.len());
        self.send_buffer.push_bytes(encoded);
        self.last_sent = Instant::now();
    }

    fn queue_handshake(&mut self) {
        let Some(torrent) = &self.torrent else {
            return;
        };
        let handshake = Handshake::new(*torrent.info_hash().as_bytes(), self.local_peer_id.0);
        let encoded = handshake.encode();
        self.stats.sent_bytes(0, encoded.len());
        self.send_buffer.push_bytes(encoded);
        self.last_sent = Instant::now();
    }

    /// Handles one framer event.
    pub fn on_wire_event(&mut self, event: WireEvent) -> Result<(), PeerError> {
        self.last_receive = Instant::now();
        match event {
            WireEvent::VersionProbe => {
                self.send_buffer.push_bytes(Bytes::from_static(VERSION_BANNER));
                self.banner_only = true;
                Ok(())
            }
            WireEvent::InfoHash {
                reserved,
                info_hash,
            } => self.incoming_info_hash(reserved, info_hash),
            WireEvent::PeerId(peer_id) => self.incoming_peer_id(peer_id),
            WireEvent::Frame(message) => self.handle_message(message),
            WireEvent::PieceStarted { index, begin } => {
                self.incoming_piece_fragment(index, begin);
                Ok(())
            }
            WireEvent::Piece { index, begin, data } => {
                self.incoming_piece(index, begin, data.freeze())
            }
        }
    }

    fn incoming_info_hash(
        &mut self,
        reserved: [u8; 8],
        info_hash: [u8; 20],
    ) -> Result<(), PeerError> {
        self.caps = RemoteCaps::from_reserved(&reserved);

        if let Some(torrent) = &self.torrent {
            // outbound: the torrent was known up front, the hashes must
            // agree
            if torrent.info_hash().as_bytes() != &info_hash {
                return Err(PeerError::UnknownInfoHash);
            }
            return Ok(());
        }

        let Some(registry) = self.registry.clone() else {
            return Err(PeerError::UnknownInfoHash);
        };
        let Some(hash) = crate::torrent::InfoHash::from_bytes(&info_hash) else {
            return Err(PeerError::InvalidHandshake);
        };
        let Some(torrent) = registry.find(&hash) else {
            return Err(PeerError::UnknownInfoHash);
        };
        self.attach(torrent);
        // the reply handshake goes out only now that the torrent is known
        self.queue_handshake();
        Ok(())
    }

    fn incoming_peer_id(&mut self, peer_id: [u8; 20]) -> Result<(), PeerError> {
        if peer_id == self.local_peer_id.0 {
            self.counters.inc(Counter::BannedPeers);
            return Err(PeerError::SelfConnection);
        }
        self.remote_peer_id = PeerId::from_bytes(&peer_id);
        self.state = ConnState::Connected;
        self.counters.inc(Counter::NumPeersConnected);
        self.alerts.post(Alert::PeerConnected {
            endpoint: self.addr,
            peer_id: self.remote_peer_id,
        });
        debug!(peer = %self.addr, id = ?self.remote_peer_id, "handshake complete");
        self.init_connected();
        Ok(())
    }

    /// Post-handshake burst: bitfield (or its fast-extension shorthand),
    /// extended handshake, DHT port, allowed-fast grants, superseeding.
    fn init_connected(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };

        if self.caps.fast_extension {
            if torrent.is_seed() && !torrent.superseeding() {
                self.queue_message(Message::HaveAll);
            } else if torrent.have_count() == 0 || torrent.superseeding() {
                self.queue_message(Message::HaveNone);
            } else {
                self.queue_message(Message::Bitfield(torrent.have_bitfield().to_bytes()));
            }
        } else if torrent.superseeding() {
            self.queue_message(Message::Bitfield(
                Bitfield::new(torrent.num_pieces() as usize).to_bytes(),
            ));
        } else {
            self.queue_message(Message::Bitfield(torrent.have_bitfield().to_bytes()));
        }

        if self.caps.extension_protocol {
            let mut hs = ExtensionHandshake::new();
            hs.client = Some(format!("btcore/{}", env!("CARGO_PKG_VERSION")));
            hs.reqq = Some(self.settings.max_allowed_in_request_queue as i64);
            hs.listen_port = self.local_dht_port;
            hs.upload_only = torrent.is_seed();
            if let Ok(payload) = hs.encode() {
                self.queue_message(Message::Extended {
                    id: EXTENSION_HANDSHAKE_ID,
                    payload,
                });
            }
        }

        if self.caps.dht_port {
            if let Some(port) = self.local_dht_port {
                self.queue_message(Message::Port(port));
            }
        }

        self.send_allowed_set();

        if torrent.superseeding() {
            let have_none = Bitfield::new(torrent.num_pieces() as usize);
            let fresh = torrent.next_superseed_piece(&[], &have_none);
            self.superseed_piece(None, fresh);
        }
    }

    /// Post-handshake message dispatch.
    pub fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        if self.state != ConnState::Connected {
            return Err(PeerError::InvalidMessage("message before handshake".into()));
        }
        self.last_receive = Instant::now();

        match message {
            Message::KeepAlive => Ok(()),
            Message::Choke => {
                self.incoming_choke();
                Ok(())
            }
            Message::Unchoke => {
                self.incoming_unchoke();
                Ok(())
            }
            Message::Interested => {
                self.incoming_interested();
                Ok(())
            }
            Message::NotInterested => {
                self.incoming_not_interested();
                Ok(())
            }
            Message::Have { piece } => self.incoming_have(piece),
            Message::Bitfield(bits) => self.incoming_bitfield(bits),
            Message::Request {
                index,
                begin,
                length,
            } => self.incoming_request(BlockRequest::new(index, begin, length)),
            Message::Piece { index, begin, data } => self.incoming_piece(index, begin, data),
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                self.incoming_cancel(BlockRequest::new(index, begin, length));
                Ok(())
            }
            Message::Port(port) => {
                // handed to the external DHT collaborator
                self.remote_dht_port = Some(port);
                Ok(())
            }
            Message::Suggest { piece } => {
                self.incoming_suggest(piece);
                Ok(())
            }
            Message::HaveAll => self.incoming_have_all(),
            Message::HaveNone => self.incoming_have_none(),
            Message::Reject {
                index,
                begin,
                length,
            } => {
                self.incoming_reject(index, begin, length);
                Ok(())
            }
            Message::AllowedFast { piece } => self.incoming_allowed_fast(piece),
            Message::Extended { id, payload } => self.incoming_extended(id, payload),
        }
    }

    pub(crate) fn incoming_have(&mut self, piece: u32) -> Result<(), PeerError> {
        let Some(torrent) = self.torrent.clone() else {
            return Err(PeerError::InvalidMessage("have before attach".into()));
        };
        if piece >= torrent.num_pieces() {
            return Err(PeerError::InvalidPieceIndex(piece));
        }

        let bitfield = self
            .remote_bitfield
            .get_or_insert_with(|| Bitfield::new(torrent.num_pieces() as usize));
        if !bitfield.has_piece(piece as usize) {
            bitfield.set_piece(piece as usize);
            self.remote_have_count += 1;
        }

        // a superseeded piece getting announced means the seed took; move
        // on to the next piece
        if torrent.superseeding() && self.uploads.is_superseeded(piece) {
            let exclude: Vec<u32> = self.uploads.superseed_pieces.iter().flatten().copied().collect();
            let bitfield = self.remote_bitfield.clone().unwrap_or_else(|| {
                Bitfield::new(torrent.num_pieces() as usize)
            });
            let fresh = torrent.next_superseed_piece(&exclude, &bitfield);
            self.superseed_piece(Some(piece), fresh);
        }

        self.update_interest();
        self.disconnect_if_redundant();
        Ok(())
    }

    pub(crate) fn incoming_bitfield(&mut self, bits: Bytes) -> Result<(), PeerError> {
        let Some(torrent) = self.torrent.clone() else {
            return Err(PeerError::InvalidMessage("bitfield before attach".into()));
        };
        let piece_count = torrent.num_pieces() as usize;
        let got = bits.len();
        let Some(bitfield) = Bitfield::from_wire(bits, piece_count) else {
            return Err(PeerError::BitfieldSizeMismatch {
                got,
                expected: piece_count.div_ceil(8),
            });
        };

        self.remote_have_count = bitfield.count();
        self.remote_bitfield = Some(bitfield);
        self.bitfield_received = true;

        self.update_interest();
        self.disconnect_if_redundant();
        Ok(())
    }

    pub(crate) fn incoming_have_all(&mut self) -> Result<(), PeerError> {
        if !self.caps.fast_extension {
            return Err(PeerError::InvalidMessage(
                "have-all without fast extension".into(),
            ));
        }
        let Some(torrent) = self.torrent.clone() else {
            return Err(PeerError::InvalidMessage("have-all before attach".into()));
        };
        let bitfield = Bitfield::full(torrent.num_pieces() as usize);
        self.remote_have_count = bitfield.count();
        self.remote_bitfield = Some(bitfield);
        self.bitfield_received = true;

        self.update_interest();
        self.disconnect_if_redundant();
        Ok(())
    }

    pub(crate) fn incoming_have_none(&mut self) -> Result<(), PeerError> {
        if !self.caps.fast_extension {
            return Err(PeerError::InvalidMessage(
                "have-none without fast extension".into(),
            ));
        }
        if self.torrent.is_none() {
            return Err(PeerError::InvalidMessage("have-none before attach".into()));
        };
        self.assume_have_none();
        Ok(())
    }

    /// A peer that never sent a bitfield implicitly has nothing.
    pub(crate) fn assume_have_none(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        self.remote_bitfield = Some(Bitfield::new(torrent.num_pieces() as usize));
        self.remote_have_count = 0;
        self.bitfield_received = true;
        self.update_interest();
    }

    pub(crate) fn incoming_extended(&mut self, id: u8, payload: Bytes) -> Result<(), PeerError> {
        if id != EXTENSION_HANDSHAKE_ID {
            // no runtime extensions are registered in the core; ignore
            trace!(peer = %self.addr, id, "unhandled extended message");
            return Ok(());
        }
        let hs = ExtensionHandshake::decode(&payload)?;

        if let Some(reqq) = hs.reqq {
            if reqq > 0 {
                self.max_out_request_queue =
                    (reqq as usize).min(self.settings.max_out_request_queue);
            }
        }
        if hs.upload_only {
            self.upload_only_remote = true;
            self.disconnect_if_redundant();
        }
        self.extension_handshake = Some(hs);
        Ok(())
    }

    /// Recomputes whether the remote has anything we want, announcing
    /// the transition.
    pub(crate) fn update_interest(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        let interested = if torrent.is_seed() {
            false
        } else {
            match &self.remote_bitfield {
                Some(remote) => remote.has_piece_not_in(&torrent.have_bitfield()),
                None => false,
            }
        };

        if interested == self.am_interested {
            return;
        }
        self.am_interested = interested;
        if interested {
            self.counters.inc(Counter::NumPeersDownInterested);
            self.queue_message(Message::Interested);
            if !self.peer_choking {
                self.request_a_block();
                self.send_block_requests();
            }
        } else {
            self.counters.add(Counter::NumPeersDownInterested, -1);
            self.queue_message(Message::NotInterested);
        }
    }

    /// Drops a connection that can serve no further purpose: both sides
    /// are complete (or upload-only).
    pub(crate) fn disconnect_if_redundant(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        if !torrent.is_seed() {
            return;
        }
        let remote_complete = self.upload_only_remote
            || self
                .remote_bitfield
                .as_ref()
                .map(|bf| bf.is_complete())
                .unwrap_or(false);
        if remote_complete {
            self.disconnect(Operation::Bittorrent, PeerError::UploadToUpload);
        }
    }

    /// Marks a suggestion we sent, avoiding repeats.
    pub fn send_suggest(&mut self, piece: u32) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        if piece >= torrent.num_pieces() {
            return;
        }
        let sent = self
            .suggest_sent
            .get_or_insert_with(|| Bitfield::new(torrent.num_pieces() as usize));
        if sent.has_piece(piece as usize) {
            return;
        }
        sent.set_piece(piece as usize);
        self.queue_message(Message::Suggest { piece });
    }

    /// Disk completion entry point.
    pub fn on_disk_event(&mut self, event: DiskEvent) {
        if self.is_disconnecting() {
            return;
        }
        match event {
            DiskEvent::WriteDone { coord, result } => self.on_write_done(coord, result),
            DiskEvent::ReadDone { request, result } => self.on_read_done(request, result),
            DiskEvent::HashDone { piece, result } => self.on_hash_done(piece, result),
        }
    }

    fn on_write_done(&mut self, coord: BlockCoord, result: Result<(), DiskError>) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        if let Err(error) = result {
            self.alerts.post(Alert::FileError {
                piece: coord.piece,
                reason: error.to_string(),
            });
            self.disconnect(Operation::FileWrite, PeerError::Disk(error.to_string()));
            return;
        }

        let Some(key) = self.key else {
            return;
        };
        torrent.with_picker(|p| p.mark_as_finished(coord, key));
        self.alerts.post(Alert::BlockFinished {
            endpoint: self.addr,
            piece: coord.piece,
            block: coord.block,
        });

        // piece complete? hand it to the hasher
        let blocks = torrent.blocks_in_piece(coord.piece);
        let complete = torrent.with_picker(|p| {
            (0..blocks).all(|b| p.is_downloaded(BlockCoord::new(coord.piece, b)))
        });
        if complete && !torrent.has_piece(coord.piece) {
            torrent.disk().async_hash(
                torrent.storage(),
                coord.piece,
                self.disk_tx.clone(),
                self.liveness.clone(),
            );
        }
    }

    fn on_hash_done(&mut self, piece: u32, result: Result<[u8; 20], DiskError>) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        match result {
            Ok(digest) => {
                let passed = torrent.verify_piece(piece, &digest);
                if passed {
                    torrent.set_have(piece);
                    self.update_interest();
                } else {
                    warn!(peer = %self.addr, piece, "piece failed verification");
                    torrent.resolve_predictive_piece(piece, false);
                    self.alerts.post(Alert::PeerError {
                        endpoint: self.addr,
                        peer_id: self.remote_peer_id,
                        operation: Operation::Bittorrent,
                        reason: format!("piece {} failed hash check", piece),
                    });
                    // this peer contributed to the bad piece: parole
                    self.on_parole = true;
                }
                self.predictive_piece_resolved(piece, passed);
            }
            Err(error) => {
                self.alerts.post(Alert::FileError {
                    piece,
                    reason: error.to_string(),
                });
            }
        }
    }

    /// The single disconnect entry point: records the operation, the
    /// error and its severity, then tears state down exactly once.
    pub fn disconnect(&mut self, operation: Operation, error: PeerError) {
        if self.state == ConnState::Disconnected {
            return;
        }
        let severity = error.severity();
        debug!(peer = %self.addr, ?operation, %error, ?severity, "disconnecting");

        // a peer that never even got through the handshake cleanly
        if self.state == ConnState::Handshaking && severity == Severity::ProtocolViolation {
            self.counters.inc(Counter::ErrorIncomingPeers);
        }

        if let PeerError::Io(io) = &error {
            let counter = match io.kind() {
                std::io::ErrorKind::ConnectionReset => Some(Counter::ConnectionReset),
                std::io::ErrorKind::UnexpectedEof => Some(Counter::ConnectionEof),
                std::io::ErrorKind::ConnectionRefused => Some(Counter::ConnectionRefused),
                std::io::ErrorKind::ConnectionAborted => Some(Counter::ConnectionAborted),
                std::io::ErrorKind::TimedOut => Some(Counter::ConnectionTimedOut),
                _ => None,
            };
            if let Some(counter) = counter {
                self.counters.inc(counter);
            }
        } else if matches!(error, PeerError::ConnectionClosed) {
            self.counters.inc(Counter::ConnectionEof);
        }

        self.liveness.revoke();
        self.cancel_all_requests();

        if let Some(torrent) = &self.torrent {
            if let Some(key) = self.key {
                torrent.remove_peer(key);
            }
        }
        if self.state == ConnState::Connected {
            self.counters.add(Counter::NumPeersConnected, -1);
        }

        let record = DisconnectRecord {
            operation,
            severity,
            reason: error.to_string(),
        };
        self.alerts.post(Alert::PeerDisconnected {
            endpoint: self.addr,
            peer_id: self.remote_peer_id,
            operation,
            severity,
            reason: record.reason.clone(),
        });
        if severity == Severity::ProtocolViolation {
            self.alerts.post(Alert::PeerError {
                endpoint: self.addr,
                peer_id: self.remote_peer_id,
                operation,
                reason: record.reason.clone(),
            });
        }
        self.disconnect_record = Some(record);
        self.state = ConnState::Disconnected;
    }

    /// Accounts bytes the socket driver wrote out of the send buffer and
    /// updates request-message positions.
    pub fn on_bytes_sent(&mut self, n: usize) {
        self.send_buffer.advance(n);
        self.last_sent = Instant::now();
        for pending in self
            .pipeline
            .download_queue
            .iter_mut()
            .chain(self.pipeline.request_queue.iter_mut())
        {
            if pending.send_buffer_offset >= 0 {
                pending.send_buffer_offset -= n as i64;
                if pending.send_buffer_offset < 0 {
                    // the request bytes have left the application
                    pending.send_buffer_offset = -1;
                }
            }
        }
    }

    /// The one-second tick: statistics, queue sizing, timeouts, snubbing
    /// and keepalive.
    pub fn tick(&mut self, now: Instant) {
        if self.is_disconnecting() {
            return;
        }
        self.stats.tick(Duration::from_secs(1));
        self.update_desired_queue_size();

        if self.state == ConnState::Handshaking {
            if now > self.connected_at + self.settings.handshake_timeout {
                self.disconnect(Operation::Bittorrent, PeerError::TimedOutNoHandshake);
            }
            return;
        }

        // general inactivity
        let quiet = now
            .duration_since(self.last_receive)
            .min(now.duration_since(self.last_sent));
        if quiet > self.settings.peer_timeout {
            self.disconnect(Operation::Bittorrent, PeerError::TimedOutInactivity);
            return;
        }

        // we unchoked an interested peer, it never asked for anything
        if let Some(torrent) = self.torrent.clone() {
            if torrent.is_seed()
                && !self.am_choking
                && self.peer_interested
                && self.uploads.requests.is_empty()
                && now.duration_since(self.last_unchoke.max(self.last_incoming_request))
                    > self.settings.no_request_timeout
            {
                self.disconnect(Operation::Bittorrent, PeerError::TimedOutNoRequest);
                return;
            }
        }

        // neither side cares, and hasn't for a long time
        if !self.am_interested
            && !self.peer_interested
            && now.duration_since(self.connected_at) > self.settings.inactivity_timeout
        {
            self.disconnect(Operation::Bittorrent, PeerError::MutualNoInterest);
            return;
        }

        // disk back-pressure is not the peer's fault; stretch its timeouts
        if let Some(torrent) = self.torrent.clone() {
            if torrent.disk().cache().pool().exceeds_watermark() {
                self.extend_timeout(Duration::from_secs(1));
            }
        }

        self.check_request_timeout(now);
        if self.is_disconnecting() {
            return;
        }
        self.check_endgame(now);

        // keepalive at half the timeout
        if now.duration_since(self.last_sent) > self.settings.peer_timeout / 2 {
            self.queue_message(Message::KeepAlive);
        }
    }

    /// Pumps queued disk completions; used by embedders that drive the
    /// connection manually (the async driver does this itself).
    pub fn poll_disk_events(&mut self) {
        let Some(mut rx) = self.disk_rx.take() else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            self.on_disk_event(event);
        }
        self.disk_rx = Some(rx);
    }

    /// The async I/O driver: pumps the socket through the framer, the
    /// bandwidth gate and the disk completion queue until disconnect.
    pub async fn run<S>(mut self, stream: S, gate: Arc<BandwidthGate>) -> DisconnectRecord
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut disk_rx = self.disk_rx.take();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.is_disconnecting() {
                break;
            }
            if self.banner_only && self.send_buffer.is_empty() {
                self.disconnect(Operation::Bittorrent, PeerError::ConnectionClosed);
                break;
            }

            // arm a disk tail for the next piece payload, respecting the
            // buffer-pool watermark (disk back-pressure)
            let mut read_allowed = true;
            if let Some(torrent) = &self.torrent {
                let pool = torrent.disk().cache().pool();
                if !self.framer.has_tail() {
                    if pool.exceeds_watermark() {
                        read_allowed = false;
                    } else if let Some(buf) = pool.try_alloc() {
                        self.framer.arm_tail(buf);
                    }
                }
            }

            let down_channel = self
                .torrent
                .as_ref()
                .map(|t| Arc::clone(t.bandwidth_channel(Direction::Down)));
            let up_channel = self
                .torrent
                .as_ref()
                .map(|t| Arc::clone(t.bandwidth_channel(Direction::Up)));
            let write_chunk: Option<Bytes> = self.send_buffer.front_bytes();

            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Instant::now());
                }
                event = async {
                    match disk_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some(event) = event {
                        self.on_disk_event(event);
                    }
                }
                read = async {
                    let channels: Vec<&crate::bandwidth::BandwidthChannel> =
                        down_channel.iter().map(|c| c.as_ref()).collect();
                    gate.acquire(Direction::Down, &channels, READ_QUOTUM).await;
                    let mut chunk = vec![0u8; READ_QUOTUM];
                    let read = rd.read(&mut chunk).await;
                    read.map(|n| {
                        gate.refund(
                            Direction::Down,
                            &channels,
                            READ_QUOTUM.saturating_sub(n),
                        );
                        chunk.truncate(n);
                        chunk
                    })
                }, if read_allowed => {
                    match read {
                        Ok(chunk) if chunk.is_empty() => {
                            self.disconnect(Operation::SockRead, PeerError::ConnectionClosed);
                        }
                        Ok(chunk) => {
                            self.stats.received_bytes(0, chunk.len());
                            if let Err(error) = self.feed_bytes(&chunk) {
                                self.disconnect(Operation::Bittorrent, error);
                            }
                        }
                        Err(error) => {
                            self.disconnect(Operation::SockRead, PeerError::Io(error));
                        }
                    }
                }
                written = async {
                    let chunk = match &write_chunk {
                        Some(chunk) => chunk,
                        None => return Ok(0),
                    };
                    let channels: Vec<&crate::bandwidth::BandwidthChannel> =
                        up_channel.iter().map(|c| c.as_ref()).collect();
                    gate.acquire(Direction::Up, &channels, chunk.len()).await;
                    wr.write(chunk).await
                }, if write_chunk.is_some() => {
                    match written {
                        Ok(0) => {
                            self.disconnect(Operation::SockWrite, PeerError::ConnectionClosed);
                        }
                        Ok(n) => {
                            self.on_bytes_sent(n);
                        }
                        Err(error) => {
                            self.disconnect(Operation::SockWrite, PeerError::Io(error));
                        }
                    }
                }
            }
        }

        let _ = wr.shutdown().await;
        self.disconnect_record.clone().unwrap_or(DisconnectRecord {
            operation: Operation::Bittorrent,
            severity: Severity::Clean,
            reason: "closed".into(),
        })
    }

    /// Drains every complete event out of the framer.
    pub fn pump_framer(&mut self) -> Result<(), PeerError> {
        loop {
            match self.framer.poll_event()? {
                Some(event) => self.on_wire_event(event)?,
                None => return Ok(()),
            }
        }
    }

    /// Feeds raw bytes as if read from the socket and processes them.
    /// The synchronous twin of the driver's read path, used directly in
    /// tests and by custom drivers.
    pub fn feed_bytes(&mut self, data: &[u8]) -> Result<(), PeerError> {
        self.framer.feed(data);
        self.pump_framer()
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if self.state != ConnState::Disconnected {
            self.disconnect(Operation::Bittorrent, PeerError::ConnectionClosed);
        }
    }
}

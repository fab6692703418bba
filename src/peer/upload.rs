//! The upload server: incoming block requests and their fulfillment.
//!
//! Requests are validated hard (range, interest, choke state, queue
//! depth), served through the block cache, and rejected when the fast
//! extension allows an explicit answer. Abuse is tracked: a peer that
//! keeps requesting while choked, or hammers one allowed-fast piece, is
//! disconnected.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use tracing::{debug, trace};

use super::connection::PeerConnection;
use super::error::PeerError;
use super::fast::generate_allowed_fast_set;
use super::message::{Message, MessageId};
use crate::alert::Alert;
use crate::cache::{ReadRequest, TryRead};
use crate::counters::Counter;
use crate::disk::DiskError;
use crate::picker::BlockRequest;

/// Grace period after a choke during which late requests are tolerated.
const CHOKE_GRACE: Duration = Duration::from_secs(2);

/// A choked peer may take at most this many times the blocks of one
/// allowed-fast piece before it counts as abuse.
const ALLOWED_FAST_OVERDRAW: u32 = 3;

/// Upload-side state. The serving logic lives on [`PeerConnection`].
#[derive(Debug, Default)]
pub struct UploadQueue {
    /// Validated requests awaiting fulfillment, in arrival order.
    pub requests: VecDeque<BlockRequest>,
    /// Requests for predictively announced pieces, parked until the
    /// piece verifies.
    pub parked: VecDeque<BlockRequest>,
    /// The request currently waiting on a disk read.
    pub reading: Option<BlockRequest>,
    pub invalid_requests: u32,
    /// At most two pieces are superseeded to a peer at a time.
    pub superseed_pieces: [Option<u32>; 2],
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_superseeded(&self, piece: u32) -> bool {
        self.superseed_pieces.contains(&Some(piece))
    }
}

impl PeerConnection {
    /// Validates and enqueues an incoming request.
    pub(crate) fn incoming_request(&mut self, r: BlockRequest) -> Result<(), PeerError> {
        let Some(torrent) = self.torrent.clone() else {
            return Err(PeerError::InvalidMessage("request before attach".into()));
        };
        self.counters.inc(Counter::PieceRequests);
        trace!(peer = %self.addr, piece = r.piece, start = r.start, len = r.length, "request");

        if torrent.superseeding() && !self.uploads.is_superseeded(r.piece) {
            self.counters.inc(Counter::InvalidPieceRequests);
            self.uploads.invalid_requests += 1;
            self.reject_request(r);
            self.alerts.post(Alert::InvalidRequest {
                endpoint: self.addr,
                peer_id: self.remote_peer_id,
                request: r,
            });
            return Ok(());
        }

        // a missing bitfield means the peer implicitly has nothing
        if !self.bitfield_received {
            self.assume_have_none();
        }

        if self.uploads.requests.len() > self.settings.max_allowed_in_request_queue {
            self.counters.inc(Counter::MaxPieceRequests);
            self.reject_request(r);
            return Ok(());
        }

        let piece_ok = r.piece < torrent.num_pieces();
        let piece_size = if piece_ok {
            torrent.piece_size(r.piece)
        } else {
            0
        };
        let have_piece = piece_ok && torrent.has_piece(r.piece);
        let predictive = piece_ok && torrent.is_predictive_piece(r.piece);

        let valid = piece_ok
            && (have_piece || predictive)
            && r.start < piece_size
            && r.length > 0
            && r.length <= torrent.block_size()
            && r.start + r.length <= piece_size
            && self.peer_interested;

        if !valid {
            self.counters.inc(Counter::InvalidPieceRequests);
            self.uploads.invalid_requests += 1;
            self.reject_request(r);
            self.alerts.post(Alert::InvalidRequest {
                endpoint: self.addr,
                peer_id: self.remote_peer_id,
                request: r,
            });

            if self.uploads.invalid_requests > self.settings.max_invalid_requests {
                return Err(PeerError::TooManyRequestsWhenChoked);
            }
            // periodically remind an uninterested peer that it's choked
            if !self.peer_interested && self.am_choking && self.uploads.invalid_requests % 10 == 0 {
                self.queue_message(Message::Choke);
            }
            return Ok(());
        }

        let granted = self.fast.is_granted(r.piece);

        if self.am_choking && granted {
            // cap how much one allowed-fast grant can be milked
            let blocks_per_piece = torrent.blocks_in_piece(0).max(1);
            let count = self.fast.count_granted_block(r.piece);
            if count >= ALLOWED_FAST_OVERDRAW * blocks_per_piece {
                return Err(PeerError::TooManyRequestsWhenChoked);
            }
        }

        if self.am_choking && !granted {
            self.counters.inc(Counter::ChokedPieceRequests);
            self.reject_request(r);

            // requests racing with our choke are fine for a couple of
            // seconds, then they're abuse
            if Instant::now() > self.last_choke + CHOKE_GRACE {
                return Err(PeerError::TooManyRequestsWhenChoked);
            }
            return Ok(());
        }

        if predictive && !have_piece {
            // park until verification resolves the announcement
            self.uploads.parked.push_back(r);
            self.last_incoming_request = Instant::now();
            return Ok(());
        }

        if self.uploads.requests.is_empty() {
            self.counters.inc(Counter::NumPeersUpRequests);
        }
        self.uploads.requests.push_back(r);
        self.last_incoming_request = Instant::now();
        self.fill_send_buffer();
        Ok(())
    }

    /// Sends a reject when the fast extension allows one; silence
    /// otherwise.
    pub(crate) fn reject_request(&mut self, r: BlockRequest) {
        if self.caps.fast_extension {
            self.queue_message(Message::Reject {
                index: r.piece,
                begin: r.start,
                length: r.length,
            });
        }
    }

    /// Rejects every queued request for one piece (failed verification,
    /// superseed rotation).
    pub(crate) fn reject_piece(&mut self, piece: u32) {
        let mut rejected: Vec<BlockRequest> = Vec::new();
        self.uploads.requests.retain(|r| {
            if r.piece == piece {
                rejected.push(*r);
                false
            } else {
                true
            }
        });
        self.uploads.parked.retain(|r| {
            if r.piece == piece {
                rejected.push(*r);
                false
            } else {
                true
            }
        });
        for r in rejected {
            self.reject_request(r);
        }
    }

    /// A predictively announced piece resolved; serve or reject what was
    /// parked on it.
    pub(crate) fn predictive_piece_resolved(&mut self, piece: u32, passed: bool) {
        if !passed {
            self.reject_piece(piece);
            return;
        }
        let mut unparked: Vec<BlockRequest> = Vec::new();
        self.uploads.parked.retain(|r| {
            if r.piece == piece {
                unparked.push(*r);
                false
            } else {
                true
            }
        });
        for r in unparked {
            if self.uploads.requests.is_empty() {
                self.counters.inc(Counter::NumPeersUpRequests);
            }
            self.uploads.requests.push_back(r);
        }
        self.fill_send_buffer();
    }

    pub(crate) fn incoming_cancel(&mut self, r: BlockRequest) {
        let before = self.uploads.requests.len();
        self.uploads.requests.retain(|q| *q != r);
        self.uploads.parked.retain(|q| *q != r);
        if self.uploads.requests.len() < before {
            // only a request we hadn't started serving can be cancelled
            self.reject_request(r);
        }
        if before > 0 && self.uploads.requests.is_empty() {
            self.counters.add(Counter::NumPeersUpRequests, -1);
        }
    }

    /// Serves queued requests through the block cache until the send
    /// buffer reaches its watermark or a disk read is needed.
    pub(crate) fn fill_send_buffer(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };

        while self.uploads.reading.is_none()
            && self.send_buffer.len() < self.settings.send_buffer_watermark
        {
            let Some(&r) = self.uploads.requests.front() else {
                break;
            };

            let cache = torrent.disk().cache().clone();
            let read = ReadRequest {
                key: torrent.piece_key(r.piece),
                offset: r.start,
                length: r.length,
                requester: self.requester_token(),
                volatile_read: false,
            };
            match cache.try_read(&read) {
                TryRead::Direct(view) => {
                    self.uploads.requests.pop_front();
                    let data = view.data().clone();
                    self.queue_piece_header(r);
                    self.send_buffer.push_pinned(data, view);
                    self.finish_upload(r);
                }
                TryRead::Copied(data) => {
                    self.uploads.requests.pop_front();
                    self.queue_piece_header(r);
                    self.send_buffer.push_bytes(data);
                    self.finish_upload(r);
                }
                TryRead::Miss => {
                    // pull the block in from disk; serving resumes on the
                    // completion event
                    let key = torrent.piece_key(r.piece);
                    let blocks = torrent.blocks_in_piece(r.piece);
                    cache.begin_read(key, blocks, self.requester_token());
                    torrent.disk().async_read(
                        key,
                        r,
                        blocks,
                        self.requester_token(),
                        false,
                        self.disk_tx.clone(),
                        self.liveness.clone(),
                    );
                    self.uploads.reading = Some(r);
                    break;
                }
                TryRead::OutOfMemory => {
                    self.disconnect(
                        super::error::Operation::Alloc,
                        PeerError::OutOfMemory,
                    );
                    return;
                }
            }
        }
    }

    /// Writes the 13-byte piece message header; the payload region
    /// follows separately (possibly as a pinned cache block).
    fn queue_piece_header(&mut self, r: BlockRequest) {
        let mut header = BytesMut::with_capacity(13);
        header.put_u32(9 + r.length);
        header.put_u8(MessageId::Piece as u8);
        header.put_u32(r.piece);
        header.put_u32(r.start);
        self.send_buffer.push_bytes(header.freeze());
        self.last_sent = Instant::now();
    }

    fn finish_upload(&mut self, r: BlockRequest) {
        self.stats.sent_bytes(r.length as usize, 13);
        self.counters.add(Counter::PayloadBytesUp, r.length as i64);
        if self.uploads.requests.is_empty() {
            self.counters.add(Counter::NumPeersUpRequests, -1);
        }
        debug!(peer = %self.addr, piece = r.piece, start = r.start, "served block");
    }

    /// Disk read completion for upload serving.
    pub(crate) fn on_read_done(
        &mut self,
        request: BlockRequest,
        result: Result<bytes::Bytes, DiskError>,
    ) {
        if self.uploads.reading != Some(request) {
            return;
        }
        self.uploads.reading = None;

        match result {
            Ok(data) => {
                self.disk_read_failures = 0;
                if self.uploads.requests.front() == Some(&request) {
                    self.uploads.requests.pop_front();
                    self.queue_piece_header(request);
                    self.send_buffer.push_bytes(data);
                    self.finish_upload(request);
                }
                self.fill_send_buffer();
            }
            Err(error) => {
                self.disk_read_failures += 1;
                self.counters.inc(Counter::DiskReadFailures);
                self.alerts.post(Alert::FileError {
                    piece: request.piece,
                    reason: error.to_string(),
                });
                self.uploads.requests.retain(|q| *q != request);
                self.reject_request(request);

                if self.disk_read_failures >= self.settings.max_disk_read_failures {
                    self.disconnect(
                        super::error::Operation::FileRead,
                        PeerError::TooManyDiskFailures,
                    );
                } else {
                    self.fill_send_buffer();
                }
            }
        }
    }

    pub(crate) fn incoming_interested(&mut self) {
        if !self.peer_interested {
            self.counters.inc(Counter::NumPeersUpInterested);
        }
        self.peer_interested = true;
        // unchoking is session policy; it calls send_unchoke
    }

    pub(crate) fn incoming_not_interested(&mut self) {
        if self.peer_interested {
            self.counters.add(Counter::NumPeersUpInterested, -1);
        }
        self.peer_interested = false;
        if !self.am_choking {
            self.send_choke();
        }
    }

    /// Chokes the remote. Queued requests for non-granted pieces are
    /// rejected so the peer can re-request elsewhere.
    pub fn send_choke(&mut self) {
        if self.am_choking {
            return;
        }
        self.am_choking = true;
        self.last_choke = Instant::now();
        self.counters.add(Counter::NumPeersUpUnchoked, -1);
        self.queue_message(Message::Choke);

        let mut rejected: Vec<BlockRequest> = Vec::new();
        self.uploads.requests.retain(|r| {
            if self.fast.is_granted(r.piece) {
                true
            } else {
                rejected.push(*r);
                false
            }
        });
        for r in rejected {
            self.reject_request(r);
        }
    }

    pub fn send_unchoke(&mut self) {
        if !self.am_choking {
            return;
        }
        self.am_choking = false;
        self.last_unchoke = Instant::now();
        self.uploads.invalid_requests = 0;
        self.counters.inc(Counter::NumPeersUpUnchoked);
        self.queue_message(Message::Unchoke);
    }

    /// Computes and sends the allowed-fast set for this peer.
    ///
    /// Pieces the remote already announced are skipped; the grants are
    /// recorded so choked requests against them are honored.
    pub(crate) fn send_allowed_set(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        if !self.caps.fast_extension {
            return;
        }
        let set = generate_allowed_fast_set(
            torrent.info_hash().as_bytes(),
            self.addr.ip(),
            torrent.num_pieces(),
            self.settings.allowed_fast_set_size,
        );
        for piece in set {
            let remote_has = self
                .remote_bitfield
                .as_ref()
                .map(|bf| bf.has_piece(piece as usize))
                .unwrap_or(false);
            if remote_has {
                continue;
            }
            self.fast.grant(piece);
            self.queue_message(Message::AllowedFast { piece });
        }
    }

    /// Assigns or rotates a superseeded piece: `replace` is withdrawn,
    /// `fresh` (if any) is announced via a single have.
    pub(crate) fn superseed_piece(&mut self, replace: Option<u32>, fresh: Option<u32>) {
        let Some(fresh) = fresh else {
            // nothing left to hand this peer
            for slot in self.uploads.superseed_pieces.iter_mut() {
                if *slot == replace {
                    *slot = None;
                }
            }
            return;
        };

        match self
            .uploads
            .superseed_pieces
            .iter_mut()
            .find(|slot| **slot == replace)
        {
            Some(slot) => *slot = Some(fresh),
            None => {
                if let Some(slot) = self
                    .uploads
                    .superseed_pieces
                    .iter_mut()
                    .find(|slot| slot.is_none())
                {
                    *slot = Some(fresh);
                }
            }
        }

        if let Some(old) = replace {
            self.reject_piece(old);
        }
        self.queue_message(Message::Have { piece: fresh });
    }
}

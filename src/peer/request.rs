//! The outgoing request pipeline.
//!
//! Keeps `desired_queue_size` blocks in flight to saturate the link
//! without exceeding the configured latency target. Blocks move from the
//! piece picker into the request queue, from there into the download
//! queue as request messages go out, and leave it when the payload
//! arrives, is rejected or times out. Slow peers get snubbed: their queue
//! collapses to one block and their unsent requests return to the picker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::connection::PeerConnection;
use super::error::PeerError;
use super::message::Message;
use crate::alert::Alert;
use crate::counters::Counter;
use crate::picker::{BlockCoord, PickHints, SpeedClass};

/// A queued outgoing block request.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub block: BlockCoord,
    /// Requested from two or more peers.
    pub busy: bool,
    /// Cancelled after being queued; the payload is unwanted.
    pub not_wanted: bool,
    pub timed_out: bool,
    /// The first payload byte has arrived.
    pub receiving: bool,
    pub requested_at: Instant,
    /// Byte offset of the request message in the send buffer; negative
    /// once the bytes left the application.
    pub send_buffer_offset: i64,
}

impl PendingBlock {
    pub fn new(block: BlockCoord) -> Self {
        Self {
            block,
            busy: false,
            not_wanted: false,
            timed_out: false,
            receiving: false,
            requested_at: Instant::now(),
            send_buffer_offset: -1,
        }
    }
}

/// Mutable pipeline state. The driving logic lives on [`PeerConnection`].
#[derive(Debug)]
pub struct RequestPipeline {
    /// Requests on the wire, in send order.
    pub download_queue: VecDeque<PendingBlock>,
    /// Requests picked but not yet sent. Time-critical blocks sit at the
    /// front.
    pub request_queue: VecDeque<PendingBlock>,
    pub queued_time_critical: usize,
    pub desired_queue_size: usize,
    /// Expected payload bytes still outstanding.
    pub outstanding_bytes: u64,
    /// Linear extension added on top of the base request timeout.
    pub timeout_extend: Duration,
    pub snubbed: bool,
    pub endgame: bool,
    /// When the oldest outstanding request was (re)issued.
    pub requested_at: Instant,
    /// When we last issued any request.
    pub last_request: Instant,
}

impl RequestPipeline {
    pub fn new(min_queue: usize) -> Self {
        let now = Instant::now();
        Self {
            download_queue: VecDeque::new(),
            request_queue: VecDeque::new(),
            queued_time_critical: 0,
            desired_queue_size: min_queue,
            outstanding_bytes: 0,
            timeout_extend: Duration::ZERO,
            snubbed: false,
            endgame: false,
            requested_at: now,
            last_request: now,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.download_queue.len() + self.request_queue.len()
    }

    fn find_download(&self, block: BlockCoord) -> Option<usize> {
        self.download_queue.iter().position(|b| b.block == block)
    }

    fn busy_in_flight(&self) -> bool {
        self.download_queue.iter().any(|b| b.busy)
    }
}

impl PeerConnection {
    /// Recomputes the target request queue depth from the current
    /// download rate and the configured queue latency.
    pub(crate) fn update_desired_queue_size(&mut self) {
        if self.pipeline.snubbed {
            self.pipeline.desired_queue_size = 1;
            return;
        }
        let Some(torrent) = self.torrent.clone() else {
            return;
        };

        let rate = self.stats.download_payload.rate();
        let queue_time = self.settings.request_queue_time.as_secs_f64();
        let block_size = torrent.block_size() as f64;

        let size = (queue_time * rate as f64 / block_size) as usize;
        self.pipeline.desired_queue_size = size
            .clamp(self.settings.min_request_queue, self.max_out_request_queue);
    }

    pub(crate) fn picker_hints(&self) -> PickHints {
        PickHints {
            rarest_first: true,
            endgame: self.pipeline.endgame,
            on_parole: self.on_parole,
            prioritize_partials: self.pipeline.snubbed,
            ..Default::default()
        }
    }

    fn speed_class(&self) -> SpeedClass {
        let rate = self.stats.download_payload.rate();
        if rate > 512 * 1024 {
            SpeedClass::Fast
        } else if rate > 64 * 1024 {
            SpeedClass::Medium
        } else {
            SpeedClass::Slow
        }
    }

    /// Pulls block coordinates from the picker into the request queue
    /// until the pipeline is at its target depth. Returns true if any
    /// block was picked.
    pub(crate) fn request_a_block(&mut self) -> bool {
        let Some(torrent) = self.torrent.clone() else {
            return false;
        };
        if self.upload_only_remote {
            return false;
        }
        let Some(bitfield) = self.remote_bitfield.clone() else {
            return false;
        };
        let Some(key) = self.key else {
            return false;
        };

        let hints = self.picker_hints();
        let speed = self.speed_class();
        let mut picked = false;
        while self.pipeline.queue_depth() < self.pipeline.desired_queue_size {
            let coord = torrent.with_picker(|p| {
                let coord = p.pick(&bitfield, hints)?;
                let busy = p.num_peers(coord) > 0;
                p.mark_as_downloading(coord, key, speed);
                Some((coord, busy))
            });
            let Some((coord, busy)) = coord else {
                break;
            };
            self.counters.inc(Counter::PiecePicks);
            if self.pipeline.endgame {
                self.counters.inc(Counter::EndGamePiecePicks);
            }

            let mut pending = PendingBlock::new(coord);
            pending.busy = busy;
            self.pipeline.request_queue.push_back(pending);
            picked = true;
        }
        picked
    }

    /// Enters endgame: re-pick with duplication allowed.
    pub(crate) fn set_endgame(&mut self, endgame: bool) {
        if self.pipeline.endgame == endgame {
            return;
        }
        debug!(peer = %self.addr, endgame, "endgame mode");
        self.pipeline.endgame = endgame;
    }

    /// Issues requests from the request queue into the send stream while
    /// the pipeline is below target.
    ///
    /// A block requested from several peers is `busy`; only one busy
    /// block may be in flight at a time unless it is time-critical.
    /// Contiguous blocks of one piece may be coalesced into a single
    /// larger request message.
    pub(crate) fn send_block_requests(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };

        if self.peer_choking && !self.can_request_while_choked_any() {
            return;
        }

        while self.pipeline.download_queue.len() < self.pipeline.desired_queue_size {
            let Some(front) = self.pipeline.request_queue.front() else {
                break;
            };

            let time_critical = self.pipeline.queued_time_critical > 0;
            if front.busy && !time_critical && self.pipeline.busy_in_flight() {
                // one busy block in flight is enough
                break;
            }
            if self.peer_choking && !self.fast.is_allowed(front.block.piece) {
                break;
            }

            let Some(mut pending) = self.pipeline.request_queue.pop_front() else {
                break;
            };
            if self.pipeline.queued_time_critical > 0 {
                self.pipeline.queued_time_critical -= 1;
            }

            let mut length = torrent.block_len(pending.block);
            let block_size = torrent.block_size();
            let start = pending.block.block * block_size;
            pending.requested_at = Instant::now();
            pending.send_buffer_offset = self.send_buffer.len() as i64;

            let mut batch = vec![pending];

            if self.settings.request_large_blocks {
                // coalesce a contiguous run within the same piece
                while let Some(next) = self.pipeline.request_queue.front() {
                    let last = &batch[batch.len() - 1];
                    if next.block.piece != last.block.piece
                        || next.block.block != last.block.block + 1
                        || self.pipeline.download_queue.len() + batch.len()
                            >= self.pipeline.desired_queue_size
                    {
                        break;
                    }
                    let Some(mut next) = self.pipeline.request_queue.pop_front() else {
                        break;
                    };
                    if self.pipeline.queued_time_critical > 0 {
                        self.pipeline.queued_time_critical -= 1;
                    }
                    next.requested_at = Instant::now();
                    next.send_buffer_offset = self.send_buffer.len() as i64;
                    length += torrent.block_len(next.block);
                    batch.push(next);
                }
            }

            let piece = batch[0].block.piece;
            trace!(peer = %self.addr, piece, start, length, "requesting");
            self.queue_message(Message::Request {
                index: piece,
                begin: start,
                length,
            });

            if self.pipeline.download_queue.is_empty() {
                self.counters.inc(Counter::NumPeersDownRequests);
            }
            for pending in batch {
                self.pipeline.outstanding_bytes += torrent.block_len(pending.block) as u64;
                self.alerts.post(Alert::BlockDownloading {
                    endpoint: self.addr,
                    piece: pending.block.piece,
                    block: pending.block.block,
                });
                self.pipeline.download_queue.push_back(pending);
            }
            self.pipeline.last_request = Instant::now();
            self.last_request = Instant::now();
            if self.pipeline.download_queue.len() == 1 {
                self.pipeline.requested_at = Instant::now();
            }
        }
    }

    fn can_request_while_choked_any(&self) -> bool {
        self.pipeline
            .request_queue
            .iter()
            .any(|b| self.fast.is_allowed(b.block.piece))
    }

    /// Clears the not-yet-sent queue, returning the blocks to the picker.
    /// On parole the queue is kept: the peer must finish what it started.
    pub(crate) fn clear_request_queue(&mut self) {
        if self.on_parole {
            return;
        }
        let Some(torrent) = self.torrent.clone() else {
            self.pipeline.request_queue.clear();
            self.pipeline.queued_time_critical = 0;
            return;
        };
        let Some(key) = self.key else {
            return;
        };
        torrent.with_picker(|p| {
            for pending in &self.pipeline.request_queue {
                p.abort_download(pending.block, key);
            }
        });
        self.pipeline.request_queue.clear();
        self.pipeline.queued_time_critical = 0;
    }

    /// Drains both queues back to the picker; the disconnect path.
    pub(crate) fn cancel_all_requests(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        let Some(key) = self.key else {
            return;
        };
        let had_downloads = !self.pipeline.download_queue.is_empty();
        torrent.with_picker(|p| {
            for pending in self
                .pipeline
                .request_queue
                .iter()
                .chain(self.pipeline.download_queue.iter())
            {
                if !pending.timed_out && !pending.not_wanted {
                    p.abort_download(pending.block, key);
                }
            }
        });
        self.pipeline.request_queue.clear();
        self.pipeline.download_queue.clear();
        self.pipeline.queued_time_critical = 0;
        self.pipeline.outstanding_bytes = 0;
        if had_downloads {
            self.counters.add(Counter::NumPeersDownRequests, -1);
        }
    }

    /// Promotes a block to the time-critical prefix of the request queue.
    pub fn make_time_critical(&mut self, block: BlockCoord) -> bool {
        if self.pipeline.snubbed {
            return false;
        }
        let Some(pos) = self
            .pipeline
            .request_queue
            .iter()
            .position(|b| b.block == block)
        else {
            return false;
        };
        if pos < self.pipeline.queued_time_critical {
            return true;
        }
        if let Some(pending) = self.pipeline.request_queue.remove(pos) {
            self.pipeline
                .request_queue
                .insert(self.pipeline.queued_time_critical, pending);
            self.pipeline.queued_time_critical += 1;
        }
        true
    }

    /// The remote choked us: unsent requests are void (fast extension
    /// peers will reject in-flight ones explicitly).
    pub(crate) fn incoming_choke(&mut self) {
        if !self.peer_choking {
            self.counters.add(Counter::NumPeersDownUnchoked, -1);
        }
        self.peer_choking = true;
        self.set_endgame(false);
        self.clear_request_queue();
    }

    pub(crate) fn incoming_unchoke(&mut self) {
        if self.peer_choking {
            self.counters.inc(Counter::NumPeersDownUnchoked);
        }
        self.peer_choking = false;
        if self.am_interested {
            if self.request_a_block() {
                self.counters.inc(Counter::UnchokePiecePicks);
            }
            self.send_block_requests();
        }
    }

    /// Fast-extension reject: the request comes back unserved.
    pub(crate) fn incoming_reject(&mut self, piece: u32, begin: u32, length: u32) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        let block_size = torrent.block_size();
        if begin % block_size != 0 {
            return;
        }
        let coord = BlockCoord::new(piece, begin / block_size);

        if let Some(pos) = self.pipeline.find_download(coord) {
            let pending = match self.pipeline.download_queue.remove(pos) {
                Some(p) => p,
                None => return,
            };
            let return_to_picker = !pending.timed_out && !pending.not_wanted;
            self.pipeline.outstanding_bytes =
                self.pipeline.outstanding_bytes.saturating_sub(length as u64);
            if self.pipeline.download_queue.is_empty() {
                self.counters.add(Counter::NumPeersDownRequests, -1);
            }

            if self.on_parole && return_to_picker {
                // keep the claim: parole peers finish their own pieces
                self.pipeline.request_queue.push_front(pending);
            } else if return_to_picker {
                if let Some(key) = self.key {
                    torrent.with_picker(|p| p.abort_download(coord, key));
                }
            }
        }

        if self.peer_choking {
            // a reject while choked withdraws the allowed-fast grant
            self.fast.remove_allowed(piece);
        } else {
            self.fast.remove_suggested(piece);
        }

        if self.pipeline.request_queue.is_empty() && self.pipeline.download_queue.len() < 2 {
            if self.request_a_block() {
                self.counters.inc(Counter::RejectPiecePicks);
            }
            self.send_block_requests();
        }
    }

    pub(crate) fn incoming_suggest(&mut self, piece: u32) {
        let Some(torrent) = &self.torrent else {
            return;
        };
        if piece >= torrent.num_pieces() || torrent.has_piece(piece) {
            return;
        }
        self.fast.add_suggested(piece);
    }

    pub(crate) fn incoming_allowed_fast(&mut self, piece: u32) -> Result<(), PeerError> {
        let Some(torrent) = &self.torrent else {
            return Ok(());
        };
        if piece >= torrent.num_pieces() {
            return Err(PeerError::InvalidPieceIndex(piece));
        }
        self.fast.add_allowed(piece);
        // a fast grant may unlock requests even while choked
        if self.am_interested && self.peer_choking {
            self.send_block_requests();
        }
        Ok(())
    }

    /// First payload byte of a piece message: record receive progress.
    pub(crate) fn incoming_piece_fragment(&mut self, piece: u32, begin: u32) {
        self.last_piece = Instant::now();
        let Some(torrent) = &self.torrent else {
            return;
        };
        let block_size = torrent.block_size();
        if begin % block_size != 0 {
            return;
        }
        let coord = BlockCoord::new(piece, begin / block_size);
        if let Some(pos) = self.pipeline.find_download(coord) {
            if let Some(pending) = self.pipeline.download_queue.get_mut(pos) {
                pending.receiving = true;
            }
        }
    }

    /// A complete piece payload arrived.
    pub(crate) fn incoming_piece(
        &mut self,
        piece: u32,
        begin: u32,
        data: bytes::Bytes,
    ) -> Result<(), PeerError> {
        let Some(torrent) = self.torrent.clone() else {
            return Err(PeerError::InvalidMessage("piece before attach".into()));
        };
        let length = data.len() as u32;
        let block_size = torrent.block_size();

        if piece >= torrent.num_pieces() {
            return Err(PeerError::InvalidPieceIndex(piece));
        }
        if begin % block_size != 0 || begin + length > torrent.piece_size(piece) {
            return Err(PeerError::InvalidMessage(format!(
                "invalid piece bounds: piece {} begin {} len {}",
                piece, begin, length
            )));
        }

        self.stats.received_bytes(length as usize, 0);
        self.last_piece = Instant::now();

        let coord = BlockCoord::new(piece, begin / block_size);
        let Some(pos) = self.pipeline.find_download(coord) else {
            let reason = if self.pipeline.endgame {
                Counter::WasteBytesEndgame
            } else {
                Counter::WasteBytesUnknown
            };
            self.account_redundant(coord, length, reason);
            return Ok(());
        };
        let pending = match self.pipeline.download_queue.remove(pos) {
            Some(p) => p,
            None => return Ok(()),
        };

        self.pipeline.outstanding_bytes = self
            .pipeline
            .outstanding_bytes
            .saturating_sub(length as u64);
        if self.pipeline.download_queue.is_empty() {
            self.counters.add(Counter::NumPeersDownRequests, -1);
        }
        self.pipeline.requested_at = Instant::now();

        // an on-time block clears the snub state and the accumulated
        // timeout extension
        let elapsed = pending.requested_at.elapsed();
        if elapsed < self.settings.request_timeout {
            self.pipeline.timeout_extend = Duration::ZERO;
            if self.pipeline.snubbed {
                self.pipeline.snubbed = false;
                self.update_desired_queue_size();
                self.alerts.post(Alert::PeerUnsnubbed {
                    endpoint: self.addr,
                    peer_id: self.remote_peer_id,
                });
            }
        }

        if pending.not_wanted {
            self.account_redundant(coord, length, Counter::WasteBytesCancelled);
            return Ok(());
        }
        if pending.timed_out {
            // the block was given up on but arrived after all; still
            // useful, though the duplicate request was waste
            self.account_redundant(coord, length, Counter::WasteBytesTimedOut);
        }

        let Some(key) = self.key else {
            return Ok(());
        };
        torrent.with_picker(|p| p.mark_as_writing(coord, key));

        self.counters.add(Counter::PayloadBytesDown, length as i64);
        torrent.disk().async_write(
            torrent.piece_key(piece),
            coord,
            data,
            torrent.blocks_in_piece(piece),
            self.requester_token(),
            self.disk_tx.clone(),
            self.liveness.clone(),
        );

        // keep the pipe full
        if self.request_a_block() {
            self.counters.inc(Counter::IncomingPiecePicks);
        }
        self.send_block_requests();
        Ok(())
    }

    /// Books a payload nobody was waiting for under a waste bucket.
    fn account_redundant(&mut self, coord: BlockCoord, length: u32, reason: Counter) {
        self.counters.add(reason, length as i64);
        debug!(peer = %self.addr, piece = coord.piece, block = coord.block, "redundant block");
    }

    /// Cancels one outstanding request (e.g. picked up elsewhere in
    /// endgame). Fast-extension peers get a cancel message; others just
    /// have the entry flagged not-wanted.
    pub fn cancel_request(&mut self, block: BlockCoord, force: bool) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };

        if let Some(pos) = self
            .pipeline
            .request_queue
            .iter()
            .position(|b| b.block == block)
        {
            if self.pipeline.request_queue.remove(pos).is_some() {
                if pos < self.pipeline.queued_time_critical {
                    self.pipeline.queued_time_critical -= 1;
                }
                if let Some(key) = self.key {
                    torrent.with_picker(|p| p.abort_download(block, key));
                }
            }
            return;
        }

        let Some(pos) = self.pipeline.find_download(block) else {
            return;
        };
        if self.caps.fast_extension || force {
            let begin = block.block * torrent.block_size();
            let length = torrent.block_len(block);
            self.queue_message(Message::Cancel {
                index: block.piece,
                begin,
                length,
            });
        }
        if let Some(pending) = self.pipeline.download_queue.get_mut(pos) {
            pending.not_wanted = true;
        }
    }

    /// Grows the request-timeout extension linearly, capped so a slow but
    /// correct peer never stalls forever.
    pub(crate) fn extend_timeout(&mut self, by: Duration) {
        let cap = self.settings.request_timeout * 4;
        self.pipeline.timeout_extend = (self.pipeline.timeout_extend + by).min(cap);
    }

    /// Snubs a slow peer: queue collapses to one, unsent requests return
    /// to the picker, and the last eligible in-flight request is timed
    /// out if its piece cannot otherwise complete.
    pub(crate) fn snub_peer(&mut self) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        if !self.pipeline.snubbed {
            self.pipeline.snubbed = true;
            self.alerts.post(Alert::PeerSnubbed {
                endpoint: self.addr,
                peer_id: self.remote_peer_id,
            });
        }
        self.pipeline.desired_queue_size = 1;

        if self.on_parole {
            self.extend_timeout(self.settings.request_timeout);
            return;
        }
        let Some(key) = self.key else {
            return;
        };

        // wipe unsent requests first
        torrent.with_picker(|p| {
            for pending in &self.pipeline.request_queue {
                p.abort_download(pending.block, key);
            }
        });
        self.pipeline.request_queue.clear();
        self.pipeline.queued_time_critical = 0;

        // pick a replacement before timing out the old block, so the
        // picker doesn't hand the same block right back
        self.pipeline.desired_queue_size = 2;
        if self.request_a_block() {
            self.counters.inc(Counter::SnubbedPiecePicks);
        }
        self.pipeline.desired_queue_size = 1;

        // time out the last eligible in-flight block, but only if that
        // unblocks the piece for other peers
        let candidate = self
            .pipeline
            .download_queue
            .iter()
            .rposition(|b| !b.timed_out && !b.not_wanted);
        if let Some(pos) = candidate {
            let coord = self.pipeline.download_queue[pos].block;
            let free = torrent.with_picker(|p| p.num_free_blocks(coord.piece));
            if free > 0 {
                self.extend_timeout(self.settings.request_timeout);
                self.send_block_requests();
                return;
            }

            self.alerts.post(Alert::BlockTimeout {
                endpoint: self.addr,
                piece: coord.piece,
                block: coord.block,
            });
            if let Some(pending) = self.pipeline.download_queue.get_mut(pos) {
                pending.timed_out = true;
            }
            torrent.with_picker(|p| p.abort_download(coord, key));
        }

        self.send_block_requests();
    }

    /// Tick-driven request timeout check.
    pub(crate) fn check_request_timeout(&mut self, now: Instant) {
        if self.pipeline.download_queue.is_empty() {
            return;
        }
        let deadline =
            self.pipeline.requested_at + self.settings.request_timeout + self.pipeline.timeout_extend;
        if now > deadline {
            self.snub_peer();
            return;
        }

        // a piece transfer that has started but stalled also counts
        let receiving = self.pipeline.download_queue.iter().any(|b| b.receiving);
        if receiving
            && now > self.last_piece + self.settings.piece_timeout + self.pipeline.timeout_extend
        {
            self.snub_peer();
        }
    }

    /// Endgame re-pick for idle interested connections.
    pub(crate) fn check_endgame(&mut self, now: Instant) {
        let Some(torrent) = self.torrent.clone() else {
            return;
        };
        if !self.am_interested
            || !self.pipeline.download_queue.is_empty()
            || !self.pipeline.request_queue.is_empty()
        {
            return;
        }
        if now < self.pipeline.last_request + Duration::from_secs(5) {
            return;
        }
        // nothing left unrequested: duplicate what's in flight elsewhere
        let unrequested = self.remote_bitfield.as_ref().map(|bf| {
            torrent.with_picker(|p| p.pick(bf, PickHints::default()).is_some())
        });
        if unrequested == Some(false) {
            self.set_endgame(true);
        }
        self.pipeline.last_request = now;
        if self.request_a_block() {
            self.counters.inc(Counter::EndGamePiecePicks);
        }
        self.send_block_requests();
    }
}

//! Incoming byte stream framing.
//!
//! The framer turns raw socket bytes into handshake events and complete
//! protocol frames. It owns the receive buffer and tracks which phase of
//! the stream it is in; the buffer never shrinks inside a packet and is
//! compacted between packets.
//!
//! Piece payloads are diverted into a pre-armed, disk-owned tail buffer of
//! block size, so a completed payload is handed to the cache without
//! another copy.

use bytes::{Buf, BytesMut};

use super::error::PeerError;
use super::handshake::{is_version_probe, PROTOCOL};
use super::message::{Message, MessageId};
use crate::config::MAX_PACKET_SIZE;

/// Where in the stream the framer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ReadProtocolLength,
    ReadProtocolString,
    ReadInfoHash,
    ReadPeerId,
    ReadPacketLength,
    ReadPacketBody,
}

/// An event produced by the framer.
#[derive(Debug)]
pub enum WireEvent {
    /// The remote sent a plain-text `version` probe instead of a handshake.
    /// The caller writes the version banner and closes gracefully.
    VersionProbe,
    /// Reserved bytes and info-hash arrived.
    InfoHash {
        reserved: [u8; 8],
        info_hash: [u8; 20],
    },
    /// The remote's peer id arrived; the handshake is complete.
    PeerId([u8; 20]),
    /// A complete post-handshake frame.
    Frame(Message),
    /// A piece payload started arriving into the disk tail buffer.
    PieceStarted { index: u32, begin: u32 },
    /// A piece payload completed in the disk tail buffer.
    Piece {
        index: u32,
        begin: u32,
        data: BytesMut,
    },
}

#[derive(Debug)]
struct PieceInFlight {
    index: u32,
    begin: u32,
    remaining: usize,
    data: BytesMut,
    started_reported: bool,
}

/// Phase-driven receive buffer and frame extractor.
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    phase: Phase,
    packet_size: usize,
    piece: Option<PieceInFlight>,
    tail: Option<BytesMut>,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(32 * 1024),
            phase: Phase::ReadProtocolLength,
            packet_size: 0,
            piece: None,
            tail: None,
        }
    }

    /// Arms the disk-owned tail buffer the next piece payload lands in.
    ///
    /// The buffer's capacity bounds the payload it can take; larger piece
    /// messages fall back to the in-buffer copy path.
    pub fn arm_tail(&mut self, buf: BytesMut) {
        self.tail = Some(buf);
    }

    pub fn has_tail(&self) -> bool {
        self.tail.is_some()
    }

    /// Appends raw socket bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The buffer the socket driver reads into.
    pub fn read_target(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Bytes buffered but not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drives the state machine one event forward.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Call in a loop after
    /// every feed; a single read can complete several frames.
    pub fn poll_event(&mut self) -> Result<Option<WireEvent>, PeerError> {
        loop {
            match self.phase {
                Phase::ReadProtocolLength => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    if self.buf[0] as usize != PROTOCOL.len() {
                        // a raw "version" probe has no length byte at all
                        if is_version_probe(&self.buf) || b"version".starts_with(&self.buf[..]) {
                            if self.buf.len() < b"version".len() {
                                return Ok(None);
                            }
                            return Ok(Some(WireEvent::VersionProbe));
                        }
                        return Err(PeerError::InvalidHandshake);
                    }
                    self.buf.advance(1);
                    self.phase = Phase::ReadProtocolString;
                }
                Phase::ReadProtocolString => {
                    if self.buf.len() < PROTOCOL.len() {
                        return Ok(None);
                    }
                    let name = self.buf.split_to(PROTOCOL.len());
                    if name[..] == *PROTOCOL {
                        self.phase = Phase::ReadInfoHash;
                        continue;
                    }
                    if is_version_probe(&name) {
                        return Ok(Some(WireEvent::VersionProbe));
                    }
                    return Err(PeerError::InvalidHandshake);
                }
                Phase::ReadInfoHash => {
                    if self.buf.len() < 28 {
                        return Ok(None);
                    }
                    let mut reserved = [0u8; 8];
                    reserved.copy_from_slice(&self.buf[..8]);
                    let mut info_hash = [0u8; 20];
                    info_hash.copy_from_slice(&self.buf[8..28]);
                    self.buf.advance(28);
                    self.phase = Phase::ReadPeerId;
                    return Ok(Some(WireEvent::InfoHash {
                        reserved,
                        info_hash,
                    }));
                }
                Phase::ReadPeerId => {
                    if self.buf.len() < 20 {
                        return Ok(None);
                    }
                    let mut peer_id = [0u8; 20];
                    peer_id.copy_from_slice(&self.buf[..20]);
                    self.buf.advance(20);
                    self.phase = Phase::ReadPacketLength;
                    return Ok(Some(WireEvent::PeerId(peer_id)));
                }
                Phase::ReadPacketLength => {
                    if self.buf.len() < 4 {
                        return Ok(None);
                    }
                    let length =
                        u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                            as usize;
                    self.buf.advance(4);
                    if length == 0 {
                        return Ok(Some(WireEvent::Frame(Message::KeepAlive)));
                    }
                    if length > MAX_PACKET_SIZE {
                        return Err(PeerError::PacketTooLarge(length));
                    }
                    self.packet_size = length;
                    self.phase = Phase::ReadPacketBody;
                }
                Phase::ReadPacketBody => {
                    if let Some(event) = self.poll_body()? {
                        return Ok(Some(event));
                    }
                    if self.phase == Phase::ReadPacketBody {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn poll_body(&mut self) -> Result<Option<WireEvent>, PeerError> {
        if let Some(piece) = self.piece.as_mut() {
            if !piece.started_reported && !self.buf.is_empty() {
                piece.started_reported = true;
                return Ok(Some(WireEvent::PieceStarted {
                    index: piece.index,
                    begin: piece.begin,
                }));
            }

            let take = piece.remaining.min(self.buf.len());
            if take > 0 {
                piece.data.extend_from_slice(&self.buf[..take]);
                self.buf.advance(take);
                piece.remaining -= take;
            }
            if piece.remaining > 0 {
                return Ok(None);
            }

            let done = self.piece.take().expect("piece in flight");
            self.phase = Phase::ReadPacketLength;
            return Ok(Some(WireEvent::Piece {
                index: done.index,
                begin: done.begin,
                data: done.data,
            }));
        }

        if self.buf.is_empty() {
            return Ok(None);
        }

        // divert large piece payloads into the armed tail buffer
        if self.buf[0] == MessageId::Piece as u8 && self.packet_size >= 9 {
            let payload_len = self.packet_size - 9;
            let fits = self
                .tail
                .as_ref()
                .map(|t| payload_len <= t.capacity())
                .unwrap_or(false);
            if fits {
                if self.buf.len() < 9 {
                    return Ok(None);
                }
                let index =
                    u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
                let begin =
                    u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]);
                self.buf.advance(9);
                let tail = self.tail.take().expect("tail armed");
                self.piece = Some(PieceInFlight {
                    index,
                    begin,
                    remaining: payload_len,
                    data: tail,
                    started_reported: false,
                });
                return self.poll_body();
            }
        }

        if self.buf.len() < self.packet_size {
            return Ok(None);
        }

        // reassemble the prefixed frame for the message decoder
        let mut frame = BytesMut::with_capacity(4 + self.packet_size);
        frame.extend_from_slice(&(self.packet_size as u32).to_be_bytes());
        frame.extend_from_slice(&self.buf[..self.packet_size]);
        self.buf.advance(self.packet_size);
        self.phase = Phase::ReadPacketLength;

        let message = Message::decode(frame.freeze())?;
        Ok(Some(WireEvent::Frame(message)))
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

use super::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::alert::{Alert, AlertSink, CollectSink};
use crate::bandwidth::BandwidthGate;
use crate::cache::{BlockCache, BufferPool};
use crate::config::Settings;
use crate::counters::{Counter, Counters};
use crate::disk::{DiskHandle, MemoryDisk};
use crate::picker::{BlockCoord, BlockRequest, PeerKey, RequestTracker, SpeedClass};
use crate::torrent::{InfoHash, Torrent, TorrentBuilder, TorrentRegistry};

const BLOCK: u32 = 16 * 1024;
const BLOCKS_PER_PIECE: u32 = 4;

struct Fixture {
    torrent: Arc<Torrent>,
    disk: Arc<MemoryDisk>,
    alerts: Arc<CollectSink>,
    counters: Arc<Counters>,
}

fn fixture(piece_count: u32, seed: bool) -> Fixture {
    let settings = Arc::new(Settings::default());
    let counters = Counters::new();
    let alerts = CollectSink::new();
    let disk = MemoryDisk::new();
    let pool = BufferPool::new(BLOCK as usize, 4096);
    let cache = BlockCache::new(
        settings.cache_size,
        settings.ghost_size(),
        pool,
        Arc::clone(&counters),
    );
    let disk_handle = DiskHandle::new(disk.clone(), cache);

    let piece_length = BLOCKS_PER_PIECE * BLOCK;
    let mut picker = RequestTracker::new(piece_count, BLOCKS_PER_PIECE, BLOCKS_PER_PIECE);
    if seed {
        for piece in 0..piece_count {
            picker.set_have(piece);
            disk.put_piece(1, piece, piece_content(piece, piece_length));
        }
    }

    let sink: Arc<dyn AlertSink> = alerts.clone();
    let torrent = TorrentBuilder {
        info_hash: InfoHash([0xAB; 20]),
        storage: 1,
        piece_count,
        piece_length,
        total_length: piece_count as u64 * piece_length as u64,
        block_size: BLOCK,
        settings,
        picker: Box::new(picker),
        disk: disk_handle,
        alerts: sink,
        counters: Arc::clone(&counters),
        seed,
        piece_hashes: None,
    }
    .build();

    Fixture {
        torrent,
        disk,
        alerts,
        counters,
    }
}

fn piece_content(piece: u32, piece_length: u32) -> Vec<u8> {
    (0..piece_length)
        .map(|i| ((i + piece * 7) % 251) as u8)
        .collect()
}

fn addr() -> SocketAddr {
    "80.4.4.200:6881".parse().expect("addr")
}

fn remote_handshake(torrent: &Torrent) -> Handshake {
    Handshake::new(*torrent.info_hash().as_bytes(), [0x77; 20])
}

/// An attached, fully handshaken outbound connection.
fn connected_peer(torrent: &Arc<Torrent>) -> PeerConnection {
    let mut conn = PeerConnection::outbound(addr(), Arc::clone(torrent), PeerId::generate());
    conn.feed_bytes(&remote_handshake(torrent).encode())
        .expect("handshake");
    assert_eq!(conn.state(), ConnState::Connected);
    conn
}

/// Seeds the pipeline with one in-flight request, the way the real flow
/// would have recorded it.
fn inject_download(conn: &mut PeerConnection, coord: BlockCoord, length: u32) {
    let key = conn.peer_key().expect("attached");
    let torrent = conn.torrent().expect("attached").clone();
    torrent.with_picker(|p| p.mark_as_downloading(coord, key, SpeedClass::Medium));
    conn.pipeline
        .download_queue
        .push_back(super::request::PendingBlock::new(coord));
    conn.pipeline.outstanding_bytes += length as u64;
    if conn.pipeline.download_queue.len() == 1 {
        conn.counters.inc(Counter::NumPeersDownRequests);
    }
}

// --- wire codec ---

#[test]
fn test_message_round_trip() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xAA, 0x55])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 2,
            begin: 0,
            data: Bytes::from_static(b"payload"),
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Port(6881),
        Message::Suggest { piece: 7 },
        Message::HaveAll,
        Message::HaveNone,
        Message::Reject {
            index: 5,
            begin: 0,
            length: 16384,
        },
        Message::AllowedFast { piece: 3 },
        Message::Extended {
            id: 1,
            payload: Bytes::from_static(b"d1:md2:ab1:0ee"),
        },
    ];

    for message in messages {
        let decoded = Message::decode(message.encode()).expect("decode");
        assert_eq!(decoded, message);
    }
}

#[test]
fn test_handshake_round_trip() {
    let handshake = Handshake::new([3u8; 20], [9u8; 20]);
    let decoded = Handshake::decode(&handshake.encode()).expect("decode");
    assert_eq!(decoded.info_hash, [3u8; 20]);
    assert_eq!(decoded.peer_id, [9u8; 20]);
    assert!(decoded.supports_extension_protocol());
    assert!(decoded.supports_fast_extension());
    assert!(decoded.supports_dht());
}

// --- handshake ---

#[tokio::test]
async fn test_handshake_attaches_and_sets_caps() {
    let f = fixture(8, false);
    let registry = TorrentRegistry::new();
    registry.insert(Arc::clone(&f.torrent));

    let mut conn = PeerConnection::inbound(
        addr(),
        registry,
        PeerId::generate(),
        Arc::new(Settings::default()),
        Arc::clone(&f.counters),
        f.alerts.clone(),
    );

    // extension protocol + dht-port, no fast extension
    let mut wire = Vec::new();
    wire.push(19u8);
    wire.extend_from_slice(b"BitTorrent protocol");
    wire.extend_from_slice(&[0, 0, 0, 0, 0, 0x10, 0, 0x01]);
    wire.extend_from_slice(&[0xAB; 20]);
    wire.extend_from_slice(&[0x77; 20]);
    conn.feed_bytes(&wire).expect("handshake");

    assert_eq!(conn.state(), ConnState::Connected);
    assert!(conn.torrent().is_some());
    assert!(conn.caps.extension_protocol);
    assert!(conn.caps.dht_port);
    assert!(!conn.caps.fast_extension);
    // our handshake reply is queued
    let front = conn.send_buffer.front_bytes().expect("reply queued");
    assert_eq!(front[0], 19);
    assert_eq!(&front[1..20], b"BitTorrent protocol");
    assert_eq!(f.alerts.count(|a| matches!(a, Alert::PeerConnected { .. })), 1);
}

#[tokio::test]
async fn test_wrong_protocol_name_is_violation() {
    let f = fixture(4, false);
    let registry = TorrentRegistry::new();
    registry.insert(Arc::clone(&f.torrent));

    let mut conn = PeerConnection::inbound(
        addr(),
        registry,
        PeerId::generate(),
        Arc::new(Settings::default()),
        Arc::clone(&f.counters),
        f.alerts.clone(),
    );

    let mut wire = Vec::new();
    wire.push(19u8);
    wire.extend_from_slice(b"not a real protocol");
    let error = conn.feed_bytes(&wire).expect_err("bad name");
    assert_eq!(error.severity(), Severity::ProtocolViolation);

    conn.disconnect(Operation::Bittorrent, error);
    assert_eq!(f.counters.get(Counter::ErrorIncomingPeers), 1);
    let record = conn.disconnect_record().expect("record");
    assert_eq!(record.severity, Severity::ProtocolViolation);
}

#[tokio::test]
async fn test_unknown_info_hash_is_rejected() {
    let registry = TorrentRegistry::new();
    let f = fixture(4, false);

    let mut conn = PeerConnection::inbound(
        addr(),
        registry,
        PeerId::generate(),
        Arc::new(Settings::default()),
        Arc::clone(&f.counters),
        f.alerts.clone(),
    );

    let handshake = Handshake::new([0xEE; 20], [0x77; 20]);
    let error = conn.feed_bytes(&handshake.encode()).expect_err("unknown hash");
    assert!(matches!(error, PeerError::UnknownInfoHash));
}

#[tokio::test]
async fn test_self_connection_is_banned() {
    let f = fixture(4, false);
    let local_id = PeerId::generate();
    let mut conn = PeerConnection::outbound(addr(), Arc::clone(&f.torrent), local_id);

    let handshake = Handshake::new(*f.torrent.info_hash().as_bytes(), local_id.0);
    let error = conn.feed_bytes(&handshake.encode()).expect_err("self");
    assert!(matches!(error, PeerError::SelfConnection));
    assert_eq!(f.counters.get(Counter::BannedPeers), 1);
}

#[tokio::test]
async fn test_version_probe_gets_banner() {
    let f = fixture(4, false);
    let registry = TorrentRegistry::new();
    registry.insert(Arc::clone(&f.torrent));

    let mut conn = PeerConnection::inbound(
        addr(),
        registry,
        PeerId::generate(),
        Arc::new(Settings::default()),
        Arc::clone(&f.counters),
        f.alerts.clone(),
    );
    conn.feed_bytes(b"version\n").expect("probe");
    let banner = conn.send_buffer.front_bytes().expect("banner");
    assert_eq!(&banner[..], VERSION_BANNER);
}

// --- framing violations ---

#[tokio::test]
async fn test_oversized_packet_disconnects_with_violation() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);

    let error = conn
        .feed_bytes(&0x0020_0001u32.to_be_bytes())
        .expect_err("oversized");
    assert!(matches!(error, PeerError::PacketTooLarge(0x0020_0001)));
    assert_eq!(error.severity(), Severity::ProtocolViolation);
    // nothing past the prefix is consumed
    assert_eq!(conn.framer.buffered(), 0);
}

#[tokio::test]
async fn test_bitfield_size_mismatch_is_violation() {
    let f = fixture(8, false);
    let mut conn = connected_peer(&f.torrent);

    // 8 pieces need exactly 1 byte
    let error = conn
        .feed_bytes(&Message::Bitfield(Bytes::from_static(&[0xFF, 0xFF])).encode())
        .expect_err("wrong size");
    assert!(matches!(
        error,
        PeerError::BitfieldSizeMismatch { got: 2, expected: 1 }
    ));
}

#[tokio::test]
async fn test_have_out_of_range_is_violation() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);
    let error = conn
        .feed_bytes(&Message::Have { piece: 4 }.encode())
        .expect_err("out of range");
    assert!(matches!(error, PeerError::InvalidPieceIndex(4)));
}

// --- interest and requesting ---

#[tokio::test]
async fn test_have_all_triggers_interest_and_requests_on_unchoke() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);

    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    assert!(conn.am_interested);

    conn.feed_bytes(&Message::Unchoke.encode()).expect("unchoke");
    assert!(!conn.peer_choking);

    // the pipeline filled to its minimum depth
    let depth = conn.pipeline.download_queue.len();
    assert_eq!(depth, conn.settings.min_request_queue);
    assert_eq!(
        conn.pipeline.outstanding_bytes,
        depth as u64 * BLOCK as u64
    );
    let in_progress = f.torrent.with_picker(|p| {
        (0..BLOCKS_PER_PIECE)
            .filter(|&b| p.is_requested(BlockCoord::new(0, b)))
            .count()
    });
    assert_eq!(in_progress, depth);
}

#[tokio::test]
async fn test_choke_clears_unsent_requests_but_keeps_downloads() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");

    let b0 = BlockCoord::new(0, 0);
    inject_download(&mut conn, b0, BLOCK);

    // three picked-but-unsent requests
    let key = conn.peer_key().expect("key");
    for block in 1..4 {
        let coord = BlockCoord::new(0, block);
        f.torrent
            .with_picker(|p| p.mark_as_downloading(coord, key, SpeedClass::Medium));
        conn.pipeline
            .request_queue
            .push_back(super::request::PendingBlock::new(coord));
    }

    conn.feed_bytes(&Message::Choke.encode()).expect("choke");

    assert!(conn.pipeline.request_queue.is_empty());
    assert_eq!(conn.pipeline.download_queue.len(), 1);
    assert_eq!(conn.pipeline.download_queue[0].block, b0);
    // the unsent blocks went back to the picker; the in-flight one didn't
    f.torrent.with_picker(|p| {
        assert!(p.is_requested(b0));
        for block in 1..4 {
            assert!(!p.is_requested(BlockCoord::new(0, block)));
        }
    });
}

#[tokio::test]
async fn test_reject_returns_block_to_picker() {
    let f = fixture(8, false);
    let mut conn = connected_peer(&f.torrent);
    // no bitfield from the remote: the pipeline won't refill after the
    // reject, isolating the accounting under test

    let coord = BlockCoord::new(5, 0);
    inject_download(&mut conn, coord, BLOCK);
    assert_eq!(f.counters.get(Counter::NumPeersDownRequests), 1);

    conn.feed_bytes(
        &Message::Reject {
            index: 5,
            begin: 0,
            length: BLOCK,
        }
        .encode(),
    )
    .expect("reject");

    assert!(conn
        .pipeline
        .download_queue
        .iter()
        .all(|b| b.block != coord));
    assert!(!f.torrent.with_picker(|p| p.is_requested(coord)));
    assert_eq!(conn.pipeline.outstanding_bytes, 0);
    assert_eq!(f.counters.get(Counter::NumPeersDownRequests), 0);
}

#[tokio::test]
async fn test_reject_while_choked_removes_allowed_fast_grant() {
    let f = fixture(8, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    conn.feed_bytes(&Message::AllowedFast { piece: 5 }.encode())
        .expect("allowed fast");
    assert!(conn.fast.is_allowed(5));
    assert!(conn.peer_choking);

    conn.feed_bytes(
        &Message::Reject {
            index: 5,
            begin: 0,
            length: BLOCK,
        }
        .encode(),
    )
    .expect("reject");
    assert!(!conn.fast.is_allowed(5));
}

#[tokio::test]
async fn test_snub_collapses_queue_and_returns_requests() {
    let f = fixture(8, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    conn.feed_bytes(&Message::Unchoke.encode()).expect("unchoke");

    assert!(!conn.pipeline.download_queue.is_empty());
    let queued: Vec<BlockCoord> = conn
        .pipeline
        .request_queue
        .iter()
        .map(|b| b.block)
        .collect();

    // pretend the oldest request has been outstanding past the timeout
    conn.pipeline.requested_at = Instant::now() - conn.settings.request_timeout * 2;
    conn.check_request_timeout(Instant::now());

    assert!(conn.pipeline.snubbed);
    assert_eq!(conn.pipeline.desired_queue_size, 1);
    for coord in queued {
        assert!(!f.torrent.with_picker(|p| p.is_requested(coord)));
    }
    assert_eq!(
        f.alerts.count(|a| matches!(a, Alert::PeerSnubbed { .. })),
        1
    );

    // an on-time block unsnubs
    let front = conn.pipeline.download_queue.front().map(|b| b.block);
    if let Some(coord) = front {
        let begin = coord.block * BLOCK;
        let payload = Bytes::from(vec![0u8; BLOCK as usize]);
        conn.feed_bytes(
            &Message::Piece {
                index: coord.piece,
                begin,
                data: payload,
            }
            .encode(),
        )
        .expect("piece");
        assert!(!conn.pipeline.snubbed);
        assert_eq!(
            f.alerts.count(|a| matches!(a, Alert::PeerUnsnubbed { .. })),
            1
        );
    }
}

#[tokio::test]
async fn test_endgame_duplicates_busy_blocks() {
    let f = fixture(1, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    conn.feed_bytes(&Message::Unchoke.encode()).expect("unchoke");

    // another peer claims everything that's left
    f.torrent.with_picker(|p| {
        for block in 0..BLOCKS_PER_PIECE {
            p.mark_as_downloading(BlockCoord::new(0, block), PeerKey(999), SpeedClass::Fast);
        }
    });
    conn.cancel_all_requests();
    assert!(conn.pipeline.download_queue.is_empty());

    conn.pipeline.last_request = Instant::now() - Duration::from_secs(6);
    conn.check_endgame(Instant::now());

    assert!(conn.pipeline.endgame);
    assert!(!conn.pipeline.download_queue.is_empty());
    assert!(conn.pipeline.download_queue[0].busy);
}

#[tokio::test]
async fn test_redundant_piece_is_counted_as_waste() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");

    let payload = Bytes::from(vec![0u8; BLOCK as usize]);
    conn.feed_bytes(
        &Message::Piece {
            index: 1,
            begin: 0,
            data: payload,
        }
        .encode(),
    )
    .expect("piece");

    assert_eq!(f.counters.get(Counter::WasteBytesUnknown), BLOCK as i64);
}

#[tokio::test]
async fn test_piece_flow_writes_and_finishes() {
    let f = fixture(1, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    conn.feed_bytes(&Message::Unchoke.encode()).expect("unchoke");

    let content = piece_content(0, BLOCKS_PER_PIECE * BLOCK);

    // feed every requested block until the piece is done
    for _ in 0..BLOCKS_PER_PIECE {
        let Some(coord) = conn.pipeline.download_queue.front().map(|b| b.block) else {
            break;
        };
        let begin = (coord.block * BLOCK) as usize;
        let payload = Bytes::copy_from_slice(&content[begin..begin + BLOCK as usize]);
        conn.feed_bytes(
            &Message::Piece {
                index: coord.piece,
                begin: begin as u32,
                data: payload,
            }
            .encode(),
        )
        .expect("piece");
    }

    // drain write + hash completions
    for _ in 0..100 {
        conn.poll_disk_events();
        if f.torrent.has_piece(0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(f.torrent.has_piece(0));
    assert_eq!(f.disk.piece(1, 0).expect("written"), content);
    assert_eq!(
        f.alerts
            .count(|a| matches!(a, Alert::BlockFinished { .. })),
        BLOCKS_PER_PIECE as usize
    );
    // outstanding accounting drained with the queue
    assert_eq!(conn.pipeline.outstanding_bytes, 0);
    assert!(conn.pipeline.download_queue.is_empty());
}

// --- upload side ---

#[tokio::test]
async fn test_request_requires_interest() {
    let f = fixture(4, true);
    let mut conn = connected_peer(&f.torrent);
    conn.send_unchoke();

    conn.feed_bytes(
        &Message::Request {
            index: 0,
            begin: 0,
            length: BLOCK,
        }
        .encode(),
    )
    .expect("handled");

    assert!(conn.uploads.requests.is_empty());
    assert_eq!(f.counters.get(Counter::InvalidPieceRequests), 1);
    assert_eq!(
        f.alerts.count(|a| matches!(a, Alert::InvalidRequest { .. })),
        1
    );
}

#[tokio::test]
async fn test_request_validation_bounds() {
    let f = fixture(4, true);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::Interested.encode()).expect("interested");
    conn.send_unchoke();

    let bad = [
        // piece out of range
        Message::Request {
            index: 4,
            begin: 0,
            length: BLOCK,
        },
        // end past the piece
        Message::Request {
            index: 0,
            begin: BLOCKS_PER_PIECE * BLOCK - 100,
            length: BLOCK,
        },
        // zero length
        Message::Request {
            index: 0,
            begin: 0,
            length: 0,
        },
        // over block size
        Message::Request {
            index: 0,
            begin: 0,
            length: BLOCK + 1,
        },
    ];
    for msg in bad {
        conn.feed_bytes(&msg.encode()).expect("rejected, not fatal");
    }
    assert!(conn.uploads.requests.is_empty());
    assert_eq!(f.counters.get(Counter::InvalidPieceRequests), 4);
}

#[tokio::test]
async fn test_choked_request_rejected_then_abused() {
    // more pieces than the allowed-fast set covers
    let f = fixture(16, true);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::Interested.encode()).expect("interested");
    assert!(conn.am_choking);

    // pick a piece outside the allowed-fast grants
    let piece = (0..16)
        .find(|p| !conn.fast.is_granted(*p))
        .expect("ungranted piece");

    // within the grace period after a choke: rejected, not fatal
    let request = Message::Request {
        index: piece,
        begin: 0,
        length: BLOCK,
    };
    conn.feed_bytes(&request.encode()).expect("tolerated");
    assert_eq!(f.counters.get(Counter::ChokedPieceRequests), 1);

    // long past the grace period: abuse
    conn.last_choke = Instant::now() - Duration::from_secs(10);
    let error = conn.feed_bytes(&request.encode()).expect_err("abuse");
    assert!(matches!(error, PeerError::TooManyRequestsWhenChoked));
}

#[tokio::test]
async fn test_allowed_fast_request_served_while_choked() {
    let f = fixture(4, true);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::Interested.encode()).expect("interested");

    let granted = conn.fast.granted_pieces().next().expect("fast set sent");
    assert!(conn.am_choking);

    let before = conn.send_buffer.len();
    conn.feed_bytes(
        &Message::Request {
            index: granted,
            begin: 0,
            length: BLOCK,
        }
        .encode(),
    )
    .expect("accepted");

    // the block comes off disk; wait for the completion
    for _ in 0..100 {
        conn.poll_disk_events();
        if conn.uploads.reading.is_none() && conn.send_buffer.len() > before {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // 13 bytes of header plus the payload
    assert!(conn.send_buffer.len() >= before + 13 + BLOCK as usize);
    assert_eq!(f.counters.get(Counter::PayloadBytesUp), BLOCK as i64);
}

#[tokio::test]
async fn test_cached_block_served_zero_copy_with_pin() {
    let f = fixture(4, true);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::Interested.encode()).expect("interested");
    conn.send_unchoke();

    let cache = f.torrent.disk().cache().clone();
    let request = Message::Request {
        index: 0,
        begin: 0,
        length: BLOCK,
    };

    // first request warms the cache from disk
    conn.feed_bytes(&request.encode()).expect("request");
    for _ in 0..100 {
        conn.poll_disk_events();
        if conn.uploads.reading.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let drained = conn.send_buffer.len();
    conn.on_bytes_sent(drained);

    // second request hits and pins
    conn.feed_bytes(&request.encode()).expect("request");
    assert!(conn.uploads.reading.is_none());
    assert_eq!(cache.stats().pinned_blocks, 1);

    // draining the send buffer releases the pin
    let drained = conn.send_buffer.len();
    conn.on_bytes_sent(drained);
    assert_eq!(cache.stats().pinned_blocks, 0);
}

#[tokio::test]
async fn test_cancel_removes_queued_request() {
    let f = fixture(4, true);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::Interested.encode()).expect("interested");
    conn.send_unchoke();

    // park a second request behind the disk read of the first
    conn.feed_bytes(
        &Message::Request {
            index: 0,
            begin: 0,
            length: BLOCK,
        }
        .encode(),
    )
    .expect("request 1");
    conn.feed_bytes(
        &Message::Request {
            index: 1,
            begin: 0,
            length: BLOCK,
        }
        .encode(),
    )
    .expect("request 2");
    // the first request stays queued while its disk read is in flight
    assert_eq!(conn.uploads.requests.len(), 2);

    conn.feed_bytes(
        &Message::Cancel {
            index: 1,
            begin: 0,
            length: BLOCK,
        }
        .encode(),
    )
    .expect("cancel");
    assert_eq!(conn.uploads.requests.len(), 1);
    assert_eq!(
        conn.uploads.requests.front(),
        Some(&BlockRequest::new(0, 0, BLOCK))
    );
}

#[tokio::test]
async fn test_disk_read_failures_drop_peer() {
    let f = fixture(4, true);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::Interested.encode()).expect("interested");
    conn.send_unchoke();
    f.disk.set_fail_reads(true);

    // threshold is configured; drive requests until the peer is dropped
    let max = conn.settings.max_disk_read_failures;
    for i in 0..max {
        if conn.is_disconnecting() {
            break;
        }
        let piece = i % 4;
        let begin = (i / 4 % BLOCKS_PER_PIECE) * BLOCK;
        let _ = conn.feed_bytes(
            &Message::Request {
                index: piece,
                begin,
                length: BLOCK,
            }
            .encode(),
        );
        for _ in 0..100 {
            conn.poll_disk_events();
            if conn.uploads.reading.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    assert!(conn.is_disconnecting());
    let record = conn.disconnect_record().expect("record");
    assert_eq!(record.operation, Operation::FileRead);
    assert!(f.counters.get(Counter::DiskReadFailures) >= max as i64);
}

// --- policy and lifecycle ---

#[tokio::test]
async fn test_seed_to_seed_disconnects() {
    let f = fixture(4, true);
    let mut conn = connected_peer(&f.torrent);

    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    assert!(conn.is_disconnecting());
    let record = conn.disconnect_record().expect("record");
    assert_eq!(record.severity, Severity::Clean);
    assert!(record.reason.contains("upload to upload"));
}

#[tokio::test]
async fn test_extended_handshake_applies_hints() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);

    let mut hs = ExtensionHandshake::with_extensions(&[("ut_metadata", 3)]);
    hs.reqq = Some(5);
    hs.upload_only = true;
    hs.listen_port = Some(51413);
    let payload = hs.encode().expect("encode");

    conn.feed_bytes(&Message::Extended { id: 0, payload }.encode())
        .expect("extended");

    assert_eq!(conn.max_out_request_queue, 5);
    assert!(conn.upload_only_remote);
    let remote = conn.extension_handshake.as_ref().expect("stored");
    assert_eq!(remote.extension_id("ut_metadata"), Some(3));
    assert_eq!(remote.listen_port, Some(51413));
    // upload-only peers are never asked for blocks
    assert!(!conn.request_a_block());
}

#[tokio::test]
async fn test_dht_port_is_recorded() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::Port(6881).encode()).expect("port");
    assert_eq!(conn.remote_dht_port, Some(6881));
}

#[tokio::test]
async fn test_keepalive_sent_when_idle() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);
    let drained = conn.send_buffer.len();
    conn.on_bytes_sent(drained);

    conn.last_sent = Instant::now() - conn.settings.peer_timeout;
    conn.tick(Instant::now());
    // an empty length prefix is the keepalive
    let front = conn.send_buffer.front_bytes().expect("keepalive");
    assert_eq!(&front[..], &[0, 0, 0, 0]);
}

#[tokio::test]
async fn test_inactivity_timeout_disconnects() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);

    let stale = Instant::now() - conn.settings.peer_timeout * 2;
    conn.last_receive = stale;
    conn.last_sent = stale;
    conn.tick(Instant::now());

    assert!(conn.is_disconnecting());
    assert!(conn
        .disconnect_record()
        .expect("record")
        .reason
        .contains("inactivity"));
}

#[tokio::test]
async fn test_disconnect_returns_queues_and_membership() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    conn.feed_bytes(&Message::Unchoke.encode()).expect("unchoke");

    assert!(f.torrent.num_peers() > 0);
    let coords: Vec<BlockCoord> = conn
        .pipeline
        .download_queue
        .iter()
        .map(|b| b.block)
        .collect();
    assert!(!coords.is_empty());

    conn.disconnect(Operation::SockRead, PeerError::ConnectionClosed);

    assert_eq!(f.torrent.num_peers(), 0);
    for coord in coords {
        assert!(!f.torrent.with_picker(|p| p.is_requested(coord)));
    }
    assert_eq!(f.torrent.with_picker(|p| p.in_progress_requests()), 0);
    assert_eq!(f.counters.get(Counter::ConnectionEof), 1);
}

#[tokio::test]
async fn test_superseeding_announces_one_piece() {
    let f = fixture(4, true);
    f.torrent.set_superseeding(true);
    let mut conn = connected_peer(&f.torrent);

    let assigned: Vec<u32> = conn
        .uploads
        .superseed_pieces
        .iter()
        .flatten()
        .copied()
        .collect();
    assert_eq!(assigned.len(), 1);
    let first = assigned[0];

    // the remote announcing the piece rotates to a fresh one
    conn.feed_bytes(&Message::Have { piece: first }.encode())
        .expect("have");
    let rotated: Vec<u32> = conn
        .uploads
        .superseed_pieces
        .iter()
        .flatten()
        .copied()
        .collect();
    assert_eq!(rotated.len(), 1);
    assert_ne!(rotated[0], first);
}

#[tokio::test]
async fn test_suggest_is_recorded_and_capped() {
    let f = fixture(8, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::Suggest { piece: 3 }.encode())
        .expect("suggest");
    assert_eq!(conn.fast.suggested_pieces(), &[3]);
    // suggestions for pieces we already have are ignored
    f.torrent.set_have(5);
    conn.feed_bytes(&Message::Suggest { piece: 5 }.encode())
        .expect("suggest");
    assert_eq!(conn.fast.suggested_pieces(), &[3]);
}

// --- async driver ---

#[tokio::test]
async fn test_run_completes_handshake_over_socket() {
    let f = fixture(4, false);
    let conn = PeerConnection::outbound(addr(), Arc::clone(&f.torrent), PeerId::generate());
    let (client, mut server) = tokio::io::duplex(256 * 1024);
    let gate = BandwidthGate::new(0, 0);

    let driver = tokio::spawn(conn.run(client, gate));

    let mut buf = vec![0u8; 68];
    server.read_exact(&mut buf).await.expect("our handshake");
    assert_eq!(&buf[1..20], b"BitTorrent protocol");
    assert_eq!(&buf[28..48], &[0xAB; 20]);

    server
        .write_all(&remote_handshake(&f.torrent).encode())
        .await
        .expect("reply");
    server
        .write_all(&Message::HaveNone.encode())
        .await
        .expect("have none");
    server.flush().await.expect("flush");

    // give the driver a moment to process, then hang up
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(server);

    let record = driver.await.expect("driver");
    assert_eq!(record.operation, Operation::SockRead);
    assert_eq!(
        f.alerts.count(|a| matches!(a, Alert::PeerConnected { .. })),
        1
    );
    assert_eq!(
        f.alerts
            .count(|a| matches!(a, Alert::PeerDisconnected { .. })),
        1
    );
}

// --- invariants ---

#[tokio::test]
async fn test_outstanding_bytes_matches_download_queue() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    conn.feed_bytes(&Message::Unchoke.encode()).expect("unchoke");

    let expected: u64 = conn
        .pipeline
        .download_queue
        .iter()
        .map(|b| f.torrent.block_len(b.block) as u64)
        .sum();
    assert_eq!(conn.pipeline.outstanding_bytes, expected);
}

#[tokio::test]
async fn test_picker_in_progress_matches_queues() {
    let f = fixture(4, false);
    let mut conn = connected_peer(&f.torrent);
    conn.feed_bytes(&Message::HaveAll.encode()).expect("have all");
    conn.feed_bytes(&Message::Unchoke.encode()).expect("unchoke");

    let queued = conn.pipeline.download_queue.len() + conn.pipeline.request_queue.len();
    assert_eq!(
        f.torrent.with_picker(|p| p.in_progress_requests()),
        queued
    );
}

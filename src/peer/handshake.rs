use bytes::{BufMut, Bytes, BytesMut};

use super::error::PeerError;

/// The protocol identifier carried in every handshake.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Total handshake length in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Banner written back to a `version` probe before closing.
pub const VERSION_BANNER: &[u8] = b"btcore/0.1\n";

/// Reserved-byte flags: byte 5 bit 0x10.
const EXTENSION_PROTOCOL_BIT: (usize, u8) = (5, 0x10);
/// Reserved-byte flags: byte 7 bit 0x01.
const DHT_PORT_BIT: (usize, u8) = (7, 0x01);
/// Reserved-byte flags: byte 7 bit 0x04.
const FAST_EXTENSION_BIT: (usize, u8) = (7, 0x04);

/// The fixed-format initial exchange.
///
/// Layout: 1-byte protocol-name length, the 19-byte protocol name, 8
/// reserved bytes, the 20-byte info-hash and the 20-byte peer-id. Reserved
/// bits advertise the extension protocol, DHT port support and the fast
/// extension.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Creates an outgoing handshake advertising the extension protocol,
    /// the fast extension and DHT port support.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_PROTOCOL_BIT.0] |= EXTENSION_PROTOCOL_BIT.1;
        reserved[FAST_EXTENSION_BIT.0] |= FAST_EXTENSION_BIT.1;
        reserved[DHT_PORT_BIT.0] |= DHT_PORT_BIT.1;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[EXTENSION_PROTOCOL_BIT.0] & EXTENSION_PROTOCOL_BIT.1) != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        (self.reserved[FAST_EXTENSION_BIT.0] & FAST_EXTENSION_BIT.1) != 0
    }

    pub fn supports_dht(&self) -> bool {
        (self.reserved[DHT_PORT_BIT.0] & DHT_PORT_BIT.1) != 0
    }

    /// Encodes the handshake for transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Decodes a complete 68-byte handshake.
    ///
    /// The incremental path lives in the framer; this is the one-shot form
    /// used where the whole handshake is already buffered.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// True for the legacy plain-text probe: the literal text `version` where
/// the protocol name belongs. The reply is [`VERSION_BANNER`] followed by a
/// graceful close.
pub fn is_version_probe(name: &[u8]) -> bool {
    name.starts_with(b"version")
}

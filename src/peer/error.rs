use thiserror::Error;

/// The operation in progress when a peer failed or was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    SockRead,
    SockWrite,
    FileRead,
    FileWrite,
    Alloc,
    Bittorrent,
}

/// How bad a disconnect was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    /// Orderly close, nothing wrong.
    Clean = 0,
    /// Transport or resource failure, not the peer's fault.
    Unexpected = 1,
    /// The peer broke the protocol; it may be banned.
    ProtocolViolation = 2,
}

/// Errors raised by the peer layer.
///
/// Every disconnect records one of these together with an [`Operation`];
/// [`PeerError::severity`] classifies it.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The handshake did not follow the fixed layout.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// An inbound peer asked for a torrent we don't have.
    #[error("unknown info hash")]
    UnknownInfoHash,

    /// The remote peer id equals our own.
    #[error("connected to ourselves")]
    SelfConnection,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message id.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// A message with a fixed wire length arrived with the wrong length.
    #[error("wrong length {length} for message id {id}")]
    WrongFixedLength { id: u8, length: usize },

    /// Length prefix exceeds the 1 MiB post-handshake cap.
    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),

    /// Bitfield byte length doesn't match the piece count, or spare bits set.
    #[error("bitfield size mismatch: got {got} bytes, expected {expected}")]
    BitfieldSizeMismatch { got: usize, expected: usize },

    /// A piece index out of the torrent's range.
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    /// The peer kept requesting while choked.
    #[error("too many requests while choked")]
    TooManyRequestsWhenChoked,

    /// Both sides are upload-only; nothing to exchange.
    #[error("upload to upload connection")]
    UploadToUpload,

    /// Neither side has been interested past the inactivity timeout.
    #[error("not interested in each other")]
    MutualNoInterest,

    /// No traffic in either direction for too long.
    #[error("timed out due to inactivity")]
    TimedOutInactivity,

    /// The handshake did not complete in time.
    #[error("timed out waiting for handshake")]
    TimedOutNoHandshake,

    /// We unchoked the peer but it never sent a request.
    #[error("timed out waiting for request")]
    TimedOutNoRequest,

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Buffer allocation failed under cache pressure.
    #[error("out of disk buffer memory")]
    OutOfMemory,

    /// A disk operation backing this peer failed.
    #[error("disk failure: {0}")]
    Disk(String),

    /// Too many consecutive disk read failures while serving this peer.
    #[error("too many disk read failures")]
    TooManyDiskFailures,

    /// Error decoding bencode in the extended handshake.
    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}

impl PeerError {
    /// Classifies the error for the disconnect record.
    pub fn severity(&self) -> Severity {
        match self {
            PeerError::InvalidHandshake
            | PeerError::UnknownInfoHash
            | PeerError::InvalidMessage(_)
            | PeerError::InvalidMessageId(_)
            | PeerError::WrongFixedLength { .. }
            | PeerError::PacketTooLarge(_)
            | PeerError::BitfieldSizeMismatch { .. }
            | PeerError::InvalidPieceIndex(_)
            | PeerError::TooManyRequestsWhenChoked
            | PeerError::Bencode(_) => Severity::ProtocolViolation,

            PeerError::SelfConnection
            | PeerError::UploadToUpload
            | PeerError::MutualNoInterest
            | PeerError::TimedOutNoRequest => Severity::Clean,

            PeerError::Io(_)
            | PeerError::TimedOutInactivity
            | PeerError::TimedOutNoHandshake
            | PeerError::ConnectionClosed
            | PeerError::OutOfMemory
            | PeerError::Disk(_)
            | PeerError::TooManyDiskFailures => Severity::Unexpected,
        }
    }
}

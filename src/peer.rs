//! Peer wire protocol.
//!
//! Framing, handshake negotiation, post-handshake message dispatch, the
//! outgoing request pipeline with snubbing and endgame, and the upload
//! server with allowed-fast handling. The state machine itself is
//! synchronous; the async socket driver lives on
//! [`connection::PeerConnection::run`].

mod bitfield;
mod connection;
mod error;
mod extension;
mod fast;
mod framer;
mod handshake;
mod message;
mod peer_id;
mod request;
mod stats;
mod upload;

pub use bitfield::Bitfield;
pub use connection::{ConnState, DisconnectRecord, PeerConnection, RemoteCaps, SendBuffer};
pub use error::{Operation, PeerError, Severity};
pub use extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID};
pub use fast::{generate_allowed_fast_set, FastState};
pub use framer::{Framer, Phase, WireEvent};
pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL, VERSION_BANNER};
pub use message::{Message, MessageId};
pub use peer_id::PeerId;
pub use request::{PendingBlock, RequestPipeline};
pub use stats::{RateEstimator, TransferStats};
pub use upload::UploadQueue;

#[cfg(test)]
mod tests;

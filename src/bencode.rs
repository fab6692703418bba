//! Bencode encoding and decoding.
//!
//! Only what the wire protocol itself requires: the extended handshake
//! carries a bencoded dictionary, so the peer layer needs a small,
//! strict codec. Torrent metainfo parsing is out of scope.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;

use super::error::PeerError;
use crate::bencode::{decode, encode, Value};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Extended message id 0 is reserved for the extended handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The extended handshake dictionary.
///
/// Carries the extension-name to extension-id mapping (`m`), the listen
/// port (`p`), the client version string (`v`), an upload-only hint and the
/// remote's request queue depth (`reqq`).
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    pub extensions: BTreeMap<String, u8>,
    pub listen_port: Option<u16>,
    pub client: Option<String>,
    pub upload_only: bool,
    pub reqq: Option<i64>,
}

impl ExtensionHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extensions(extensions: &[(&str, u8)]) -> Self {
        let mut hs = Self::new();
        for (name, id) in extensions {
            hs.extensions.insert((*name).to_string(), *id);
        }
        hs
    }

    pub fn encode(&self) -> Result<Bytes, PeerError> {
        let mut dict = BTreeMap::new();

        let mut m = BTreeMap::new();
        for (name, id) in &self.extensions {
            m.insert(
                Bytes::copy_from_slice(name.as_bytes()),
                Value::Integer(*id as i64),
            );
        }
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));

        if let Some(port) = self.listen_port {
            dict.insert(Bytes::from_static(b"p"), Value::Integer(port as i64));
        }

        if let Some(ref client) = self.client {
            dict.insert(Bytes::from_static(b"v"), Value::string(client));
        }

        if self.upload_only {
            dict.insert(Bytes::from_static(b"upload_only"), Value::Integer(1));
        }

        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::Integer(reqq));
        }

        let encoded = encode(&Value::Dict(dict))?;
        Ok(Bytes::from(encoded))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::InvalidMessage("extended handshake: expected dict".into()))?;

        let mut hs = Self::new();

        if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
            for (key, val) in m {
                if let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) {
                    // id 0 disables the extension on the remote side
                    if id > 0 && id <= u8::MAX as i64 {
                        hs.extensions.insert(name.to_string(), id as u8);
                    }
                }
            }
        }

        hs.listen_port = dict
            .get(b"p".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|p| u16::try_from(p).ok());

        hs.client = dict
            .get(b"v".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);

        hs.upload_only = dict
            .get(b"upload_only".as_slice())
            .and_then(|v| v.as_integer())
            .unwrap_or(0)
            != 0;

        hs.reqq = dict.get(b"reqq".as_slice()).and_then(|v| v.as_integer());

        Ok(hs)
    }

    /// The remote's id for a named extension, if it advertised one.
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }
}

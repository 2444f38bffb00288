//! # Extension Protocol
//!
//! The extension protocol multiplexes additional message kinds over the
//! EXTENDED peer wire message. Extension id 0 is the extension handshake, a
//! bencoded dictionary whose `m` entry maps extension names to the numeric
//! ids the peer chose for them. The only extension this client negotiates is
//! `ut_metadata`, which transfers the torrent's info dictionary in 16 KiB
//! blocks so magnet links can bootstrap without a `.torrent` file.
//!
//! A metadata message is a bencoded header followed by raw block bytes:
//!
//! ```text
//! d8:msg_typei1e5:piecei0e10:total_sizei34256ee<block bytes>
//! ```

use anyhow::{anyhow, Result};

use crate::bencode;

/// Metadata message types.
pub const MSG_REQUEST: i64 = 0;
pub const MSG_DATA: i64 = 1;
#[allow(dead_code)]
pub const MSG_REJECT: i64 = 2;

/// The extension handshake received from a peer.
#[derive(Debug, Default, Clone)]
pub struct ExtensionHandshake {
    /// The peer's numeric id for `ut_metadata`, zero when unsupported.
    metadata_id: i64,
    /// Total metadata size in bytes, as reported by the peer.
    metadata_size: i64,
}

impl ExtensionHandshake {
    /// Parses the bencoded handshake dictionary.
    pub fn parse(data: &[u8]) -> Result<ExtensionHandshake> {
        let (value, _) = bencode::decode(data)
            .map_err(|e| anyhow!("extension: invalid handshake dictionary: {}", e))?;

        let metadata_id = value
            .get(b"m")
            .and_then(|ids| ids.get(b"ut_metadata"))
            .and_then(bencode::Value::as_integer)
            .unwrap_or(0);

        let metadata_size = value
            .get(b"metadata_size")
            .and_then(bencode::Value::as_integer)
            .unwrap_or(0);

        Ok(ExtensionHandshake {
            metadata_id,
            metadata_size,
        })
    }

    /// Returns true if the peer announced a `ut_metadata` id.
    pub fn supports_metadata_extension(&self) -> bool {
        self.metadata_id > 0
    }

    /// The id to use when sending metadata requests to this peer.
    pub fn metadata_message_id(&self) -> u8 {
        self.metadata_id as u8
    }

    /// The reported metadata size in bytes.
    pub fn metadata_size(&self) -> usize {
        self.metadata_size.max(0) as usize
    }
}

/// A non-handshake extension message.
#[derive(Debug)]
pub struct ExtensionMessage {
    /// The extension id the message arrived under.
    #[allow(dead_code)]
    pub id: u8,
    /// Metadata message type (request, data or reject).
    pub msg_type: i64,
    /// Block index within the metadata.
    pub piece: i64,
    /// Total metadata size, sent with data messages.
    #[allow(dead_code)]
    pub total_size: i64,
    /// Raw block bytes trailing the bencoded header.
    pub data: Vec<u8>,
}

impl ExtensionMessage {
    /// Parses the bencoded header and keeps the raw trailing bytes.
    pub fn parse(id: u8, data: &[u8]) -> Result<ExtensionMessage> {
        let (value, rest) = bencode::decode(data)
            .map_err(|e| anyhow!("extension: invalid message dictionary: {}", e))?;

        let field = |key: &[u8]| {
            value
                .get(key)
                .and_then(bencode::Value::as_integer)
                .unwrap_or(0)
        };

        Ok(ExtensionMessage {
            id,
            msg_type: field(b"msg_type"),
            piece: field(b"piece"),
            total_size: field(b"total_size"),
            data: rest.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_handshake() {
        let data = b"d1:md11:ut_metadatai3ee13:metadata_sizei31235ee";
        let handshake = ExtensionHandshake::parse(data).unwrap();
        assert!(handshake.supports_metadata_extension());
        assert_eq!(handshake.metadata_message_id(), 3);
        assert_eq!(handshake.metadata_size(), 31235);
    }

    #[test]
    fn parse_handshake_without_metadata() {
        let data = b"d1:md6:ut_pexi1eee";
        let handshake = ExtensionHandshake::parse(data).unwrap();
        assert!(!handshake.supports_metadata_extension());
        assert_eq!(handshake.metadata_size(), 0);
    }

    #[test]
    fn parse_data_message_with_trailing_block() {
        let mut data = b"d8:msg_typei1e5:piecei2e10:total_sizei34256ee".to_vec();
        data.extend_from_slice(b"raw block bytes");

        let msg = ExtensionMessage::parse(4, &data).unwrap();
        assert_eq!(msg.msg_type, MSG_DATA);
        assert_eq!(msg.piece, 2);
        assert_eq!(msg.total_size, 34256);
        assert_eq!(msg.data, b"raw block bytes");
    }

    #[test]
    fn parse_reject_message() {
        let msg = ExtensionMessage::parse(4, b"d8:msg_typei2e5:piecei0ee").unwrap();
        assert_eq!(msg.msg_type, MSG_REJECT);
        assert!(msg.data.is_empty());
    }
}

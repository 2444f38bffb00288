//! # Peer Wire Messages
//!
//! Every message after the handshake is a length-prefixed frame:
//!
//! ```text
//! <length: u32><id: u8><payload>
//! ```
//!
//! The length prefix is big-endian and covers the id byte plus the payload.
//! A frame of length zero is a keep-alive and carries neither id nor payload.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | bitfield bytes |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//! | 9 | PORT | DHT listen port |
//! | 20 | EXTENDED | extension id, extension payload |
//!
//! The typed parsers in this module validate payload shapes and convert them
//! into the richer types used by the rest of the client.

use std::collections::BTreeMap;
use std::io::{self, Read};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::bencode::{self, Value};
use crate::extension::{ExtensionHandshake, ExtensionMessage};
use crate::piece::Block;

pub const CHOKE: u8 = 0;
pub const UNCHOKE: u8 = 1;
pub const INTERESTED: u8 = 2;
#[allow(dead_code)]
pub const NOT_INTERESTED: u8 = 3;
pub const HAVE: u8 = 4;
pub const BITFIELD: u8 = 5;
pub const REQUEST: u8 = 6;
pub const PIECE: u8 = 7;
#[allow(dead_code)]
pub const CANCEL: u8 = 8;
#[allow(dead_code)]
pub const PORT: u8 = 9;
pub const EXTENDED: u8 = 20;

/// A peer wire message, either received from or destined for a peer.
#[derive(Debug)]
pub struct Message {
    /// Message type identifier.
    pub id: u8,
    /// Message payload, may be empty.
    pub payload: Vec<u8>,
}

impl Message {
    /// Serializes the message with its length prefix.
    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        // infallible, Vec<u8> writes cannot fail
        let _ = buf.write_u32::<BigEndian>(1 + self.payload.len() as u32);
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Reads one message frame from `reader`.
///
/// Returns `None` for a keep-alive. The caller is responsible for arming a
/// read deadline on the underlying connection before each call.
pub fn read<R: Read>(reader: &mut R) -> io::Result<Option<Message>> {
    let length = reader.read_u32::<BigEndian>()?;

    // keep-alive
    if length == 0 {
        return Ok(None);
    }

    let mut buf = vec![0; length as usize];
    reader.read_exact(&mut buf)?;

    Ok(Some(Message {
        id: buf[0],
        payload: buf[1..].to_vec(),
    }))
}

/// Builds a REQUEST message for one block of a piece.
pub fn new_request(index: u32, begin: u32, length: u32) -> Message {
    let mut payload = Vec::with_capacity(12);
    let _ = payload.write_u32::<BigEndian>(index);
    let _ = payload.write_u32::<BigEndian>(begin);
    let _ = payload.write_u32::<BigEndian>(length);

    Message {
        id: REQUEST,
        payload,
    }
}

/// Builds an INTERESTED message.
pub fn new_interested() -> Message {
    Message {
        id: INTERESTED,
        payload: vec![],
    }
}

/// Builds a metadata block request to send over the extension protocol.
///
/// The payload is the peer's metadata extension id followed by the bencoded
/// request dictionary.
pub fn new_metadata_request(id: u8, piece: usize) -> Message {
    let mut dict = BTreeMap::new();
    dict.insert(b"msg_type".to_vec(), Value::Integer(0));
    dict.insert(b"piece".to_vec(), Value::Integer(piece as i64));

    let data = bencode::encode(&Value::Dict(dict));

    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(id);
    payload.extend_from_slice(&data);

    Message {
        id: EXTENDED,
        payload,
    }
}

/// Parses a HAVE message into its piece index.
pub fn parse_have(msg: &Message) -> Result<u32> {
    if msg.id != HAVE || msg.payload.len() != 4 {
        return Err(anyhow!("message: unable to parse message as `have`"));
    }

    let mut cursor = io::Cursor::new(&msg.payload);
    Ok(cursor.read_u32::<BigEndian>()?)
}

/// Parses a PIECE message into a [`Block`].
pub fn parse_piece_block(msg: &Message) -> Result<Block> {
    if msg.id != PIECE || msg.payload.len() < 8 {
        return Err(anyhow!("message: unable to parse message as `piece`"));
    }

    let mut cursor = io::Cursor::new(&msg.payload[0..8]);
    let index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;

    Ok(Block {
        index,
        begin,
        data: msg.payload[8..].to_vec(),
    })
}

/// Returns true if the message is the extension handshake (extension id 0).
pub fn is_extension_handshake(msg: &Message) -> bool {
    msg.id == EXTENDED && !msg.payload.is_empty() && msg.payload[0] == 0
}

/// Parses an extension handshake message.
pub fn parse_extension_handshake(msg: &Message) -> Result<ExtensionHandshake> {
    if !is_extension_handshake(msg) {
        return Err(anyhow!("message: message is not an extension handshake"));
    }

    ExtensionHandshake::parse(&msg.payload[1..])
}

/// Parses a non-handshake extension message.
pub fn parse_extension_message(msg: &Message) -> Result<ExtensionMessage> {
    if msg.id != EXTENDED || msg.payload.is_empty() || msg.payload[0] == 0 {
        return Err(anyhow!("message: message is not an extension message"));
    }

    ExtensionMessage::parse(msg.payload[0], &msg.payload[1..])
}

//! # BitTorrent Handshake
//!
//! The handshake is the first message exchanged on a fresh peer connection.
//! It is a fixed-layout frame:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol string (19)
//! - **pstr**: the ASCII protocol string ("BitTorrent protocol")
//! - **reserved**: 8 bytes of feature flags
//! - **info_hash**: 20 bytes identifying the torrent
//! - **peer_id**: 20 bytes identifying the peer
//!
//! ## Reserved Bits
//!
//! Bit 20 counted from the right (byte 5, mask `0x10`) advertises support
//! for the extension protocol. The client always sets it; a peer supports
//! extensions iff the same bit is set in its reply.

use std::io::Read;

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// A handshake frame, either ours or one received from a peer.
pub struct Handshake {
    /// Protocol identifier string.
    pstr: String,
    /// Feature flag bytes.
    reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary.
    pub info_hash: Vec<u8>,
    /// 20-byte identifier of the sending peer.
    #[allow(dead_code)]
    peer_id: Vec<u8>,
}

impl Handshake {
    /// Creates the client handshake with the extension protocol bit set.
    pub fn new(info_hash: &[u8], peer_id: &[u8]) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.to_string(),
            reserved: [0, 0, 0, 0, 0, 0x10, 0, 0],
            info_hash: info_hash.to_vec(),
            peer_id: peer_id.to_vec(),
        }
    }

    /// Serializes the handshake for transmission.
    ///
    /// Total size is `49 + pstrlen` bytes (68 for the standard protocol).
    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49 + self.pstr.len());
        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(self.pstr.as_bytes());
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Returns true if the peer advertised the extension protocol.
    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & 0x10 == 0x10
    }

    /// Reads a handshake from `reader`.
    ///
    /// # Errors
    ///
    /// Fails on an empty protocol string length, truncated input or an
    /// underlying I/O error.
    pub fn read<R: Read>(reader: &mut R) -> Result<Handshake> {
        let mut len_buf = [0; 1];
        reader
            .read_exact(&mut len_buf)
            .map_err(|e| anyhow!("handshake: could not read protocol strlen: {}", e))?;

        let pstrlen = len_buf[0] as usize;
        if pstrlen == 0 {
            return Err(anyhow!("handshake: invalid protocol strlen (0)"));
        }

        let mut buf = vec![0; pstrlen + 48];
        reader
            .read_exact(&mut buf)
            .map_err(|e| anyhow!("handshake: could not read handshake body: {}", e))?;

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[pstrlen..pstrlen + 8]);

        // offset past the reserved bytes
        let offset = pstrlen + 8;

        Ok(Handshake {
            pstr: String::from_utf8_lossy(&buf[0..pstrlen]).into_owned(),
            reserved,
            info_hash: buf[offset..offset + 20].to_vec(),
            peer_id: buf[offset + 20..offset + 40].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn serialized_layout() {
        let info_hash = vec![1; 20];
        let peer_id = vec![2; 20];
        let handshake = Handshake::new(&info_hash, &peer_id);

        let buf = handshake.bytes();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0, 0, 0, 0, 0, 0x10, 0, 0]);
        assert_eq!(&buf[28..48], info_hash.as_slice());
        assert_eq!(&buf[48..68], peer_id.as_slice());
    }

    #[test]
    fn roundtrip_through_read() {
        let handshake = Handshake::new(&[7; 20], &[9; 20]);
        let buf = handshake.bytes();

        let parsed = Handshake::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(parsed.info_hash, vec![7; 20]);
        assert_eq!(parsed.peer_id, vec![9; 20]);
        assert!(parsed.supports_extension_protocol());
    }

    #[test]
    fn extension_bit_detection() {
        let mut buf = Handshake::new(&[0; 20], &[0; 20]).bytes();
        assert!(Handshake::read(&mut Cursor::new(buf.clone()))
            .unwrap()
            .supports_extension_protocol());

        // clear reserved byte 5
        buf[25] = 0x00;
        assert!(!Handshake::read(&mut Cursor::new(buf))
            .unwrap()
            .supports_extension_protocol());
    }

    #[test]
    fn rejects_empty_protocol_string() {
        let buf = vec![0; 68];
        assert!(Handshake::read(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        let buf = Handshake::new(&[0; 20], &[0; 20]).bytes();
        assert!(Handshake::read(&mut Cursor::new(&buf[..40])).is_err());
    }
}

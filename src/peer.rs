//! # Swarm Peer
//!
//! A `Peer` is one remote swarm member: its address plus everything we have
//! learned about it over the connection, namely the base handshake (for
//! feature flags), the extension handshake (for the metadata message id and
//! size) and the bitfield of pieces it holds.
//!
//! Peers arrive from trackers in compact form, six bytes per peer: a 4-byte
//! IPv4 address followed by a big-endian 2-byte port.

use std::fmt;
use std::net::Ipv4Addr;

use crate::bitfield::Bitfield;
use crate::extension::ExtensionHandshake;
use crate::handshake::Handshake;

/// A remote peer and the connection state learned about it.
pub struct Peer {
    /// IPv4 address of the peer.
    pub ip: Ipv4Addr,
    /// Port the peer listens on.
    pub port: u16,
    /// Which pieces the peer claims to have.
    bitfield: Bitfield,
    /// The base handshake received from the peer.
    handshake: Option<Handshake>,
    /// The extension handshake received from the peer.
    extension: Option<ExtensionHandshake>,
}

impl Peer {
    /// Creates a peer from its address.
    pub fn new(ip: Ipv4Addr, port: u16) -> Peer {
        Peer {
            ip,
            port,
            bitfield: Bitfield::default(),
            handshake: None,
            extension: None,
        }
    }

    /// Returns true once the peer has sent or implied a bitfield.
    pub fn has_bitfield(&self) -> bool {
        !self.bitfield.is_empty()
    }

    /// Replaces the peer's bitfield with raw bytes from a BITFIELD message.
    pub fn set_bitfield(&mut self, data: Vec<u8>) {
        self.bitfield = Bitfield::new(data);
    }

    /// Installs a zero-filled bitfield sized for `nb_pieces` pieces.
    pub fn init_bitfield(&mut self, nb_pieces: usize) {
        self.bitfield = Bitfield::sized(nb_pieces);
    }

    /// Returns true if the peer has the given piece.
    pub fn has_piece(&self, piece: u32) -> bool {
        self.bitfield.has_piece(piece as usize)
    }

    /// Marks a piece as held by the peer.
    pub fn set_piece(&mut self, piece: u32) {
        self.bitfield.set_piece(piece as usize);
    }

    /// Records the base handshake received from the peer.
    pub fn set_handshake(&mut self, handshake: Handshake) {
        self.handshake = Some(handshake);
    }

    /// Returns true if the peer's handshake advertised the extension protocol.
    pub fn supports_extension_protocol(&self) -> bool {
        self.handshake
            .as_ref()
            .is_some_and(Handshake::supports_extension_protocol)
    }

    /// Records the extension handshake received from the peer.
    pub fn set_extension_handshake(&mut self, handshake: ExtensionHandshake) {
        self.extension = Some(handshake);
    }

    /// Returns true if the peer announced a `ut_metadata` id.
    pub fn supports_metadata_extension(&self) -> bool {
        self.extension
            .as_ref()
            .is_some_and(ExtensionHandshake::supports_metadata_extension)
    }

    /// The id to use for metadata requests towards this peer.
    pub fn metadata_message_id(&self) -> u8 {
        self.extension
            .as_ref()
            .map_or(0, ExtensionHandshake::metadata_message_id)
    }

    /// The metadata size the peer reported.
    pub fn metadata_size(&self) -> usize {
        self.extension
            .as_ref()
            .map_or(0, ExtensionHandshake::metadata_size)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_lifecycle() {
        let mut peer = Peer::new(Ipv4Addr::new(10, 0, 0, 1), 6881);
        assert!(!peer.has_bitfield());
        assert!(!peer.has_piece(0));

        peer.init_bitfield(12);
        assert!(peer.has_bitfield());

        peer.set_piece(9);
        assert!(peer.has_piece(9));
        assert!(!peer.has_piece(8));
    }

    #[test]
    fn display_joins_host_and_port() {
        let peer = Peer::new(Ipv4Addr::new(192, 168, 1, 2), 6889);
        assert_eq!(peer.to_string(), "192.168.1.2:6889");
    }

    #[test]
    fn feature_flags_default_to_false() {
        let peer = Peer::new(Ipv4Addr::new(10, 0, 0, 1), 6881);
        assert!(!peer.supports_extension_protocol());
        assert!(!peer.supports_metadata_extension());
        assert_eq!(peer.metadata_message_id(), 0);
        assert_eq!(peer.metadata_size(), 0);
    }
}

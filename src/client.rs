//! # Peer Client
//!
//! One `Client` drives one TCP connection to one peer through the whole
//! download lifecycle:
//!
//! 1. **Connect**: dial the peer and exchange handshakes
//! 2. **Metadata**: fetch the info dictionary first when the torrent came
//!    from a magnet link
//! 3. **Bitfield**: learn which pieces the peer can serve
//! 4. **Pieces**: pull pieces from the shared work queue, download their
//!    blocks with a pipeline of requests, verify and hand them over
//!
//! ## States
//!
//! ```text
//! Idle -> Connecting -> Connected -> Downloading -> Done
//!                \----------+-----------/
//!                           v
//!                      Disconnected
//! ```
//!
//! Any fatal error closes the socket and moves the client to
//! `Disconnected`. Transient timeouts are retried a bounded number of
//! times at the dial and at every message read.
//!
//! ## Flow Control
//!
//! The peer starts us out choked. Requests are only issued while unchoked,
//! with up to five block requests in flight per piece. A choke mid-piece
//! pauses the pipeline; already-received blocks are kept.

use std::io::{self, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;

use crate::extension;
use crate::handshake::Handshake;
use crate::message::{self, Message};
use crate::peer::Peer;
use crate::piece::Piece;
use crate::torrent::Torrent;

// Size of one block request (16KB)
const BLOCK_SIZE: usize = 16384;

// Bounded retries for the TCP dial and for timed-out reads
const DIAL_RETRIES_MAX: u32 = 5;
const RECEIVE_RETRIES_MAX: u32 = 5;

// Messages we are willing to wait for a bitfield to show up
const BITFIELD_WAIT_MAX: u32 = 10;

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Downloading,
    Done,
}

/// The connection towards one peer.
pub struct Client {
    conn: Option<TcpStream>,
    torrent: Arc<Torrent>,
    pub peer: Peer,
    /// The piece currently being downloaded from this peer.
    piece: Option<Piece>,
    /// HAVE messages received before the manifest was complete, replayed
    /// into the bitfield once the number of pieces is known.
    have_buf: Vec<u32>,
    pub state: State,
    /// The peer has choked us, no requests may be issued.
    choked: bool,
    /// We told the peer we want to download.
    interested: bool,
}

/// Returns true if the error chain bottoms out in a broken pipe or a
/// connection reset, the transient failures worth a reconnect attempt.
pub fn is_connection_reset(err: &anyhow::Error) -> bool {
    err.downcast_ref::<io::Error>().is_some_and(|err| {
        matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
        )
    })
}

fn is_io_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn is_transient_dial_error(err: &io::Error) -> bool {
    is_io_timeout(err)
        || matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
        )
}

impl Client {
    pub fn new(peer: Peer, torrent: Arc<Torrent>) -> Client {
        Client {
            conn: None,
            torrent,
            peer,
            piece: None,
            have_buf: vec![],
            state: State::Idle,
            choked: true,
            interested: false,
        }
    }

    /// Dials the peer and exchanges handshakes.
    ///
    /// The dial is retried on timeouts and transient resets. The handshake
    /// exchange runs under a combined deadline and fails the connection on
    /// an info-hash mismatch.
    pub fn connect(&mut self) -> Result<()> {
        self.state = State::Connecting;

        match self.try_connect() {
            Ok(()) => {
                self.state = State::Connected;
                Ok(())
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Runs the download phase until the work queue is drained.
    pub fn download(&mut self, downloaded: &Sender<Piece>) -> Result<()> {
        self.state = State::Downloading;

        match self.try_download(downloaded) {
            Ok(()) => {
                self.shutdown_conn();
                self.state = State::Done;
                Ok(())
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    fn try_connect(&mut self) -> Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(self.peer.ip), self.peer.port);

        let mut retries = 0;
        let conn = loop {
            if retries >= DIAL_RETRIES_MAX {
                return Err(anyhow!("client: could not connect to peer {}", self.peer));
            }

            match TcpStream::connect_timeout(&addr, Duration::from_secs(10)) {
                Ok(conn) => break conn,
                Err(err) if is_transient_dial_error(&err) => retries += 1,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("client: could not connect to peer {}", self.peer))
                }
            }
        };

        self.conn = Some(conn);
        self.establish_handshake()
    }

    /// Sends our handshake, reads the peer's reply and verifies it refers
    /// to the same torrent.
    fn establish_handshake(&mut self) -> Result<()> {
        let handshake = Handshake::new(self.torrent.info_hash(), self.torrent.peer_id());

        let received = {
            let conn = self.conn()?;

            debug!("client: establishing handshake with {}", self.peer);

            // the write and the read share one handshake deadline
            let start = Instant::now();
            conn.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

            let mut writer = conn;
            writer
                .write_all(&handshake.bytes())
                .context("client: could not send handshake to peer")?;

            let remaining = HANDSHAKE_TIMEOUT.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(anyhow!("client: handshake with {} timed out", self.peer));
            }
            conn.set_read_timeout(Some(remaining))?;

            let mut reader = conn;
            let received = Handshake::read(&mut reader)?;

            conn.set_write_timeout(None)?;
            conn.set_read_timeout(None)?;
            received
        };

        if received.info_hash != self.torrent.info_hash() {
            return Err(anyhow!(
                "client: received an invalid info hash from {}",
                self.peer
            ));
        }

        debug!("client: handshake established with {}", self.peer);

        self.peer.set_handshake(received);
        Ok(())
    }

    fn try_download(&mut self, downloaded: &Sender<Piece>) -> Result<()> {
        // a magnet-born torrent needs its metadata before any piece can be
        // requested
        if self.torrent.incomplete() {
            self.download_metadata()?;
        }

        self.flush_have_buffer();

        // wait a couple of messages for a BITFIELD, or for HAVEs to build one
        let mut tries = 0;
        while !self.peer.has_bitfield() {
            if tries >= BITFIELD_WAIT_MAX {
                return Err(anyhow!(
                    "client: waited too long for a bitfield or have message"
                ));
            }

            self.receive()?;
            tries += 1;
        }

        self.send_interested()?;

        debug!("client: requesting pieces from {}", self.peer);
        self.request_pieces(downloaded)
    }

    /// Drives the connection until the metadata is complete.
    ///
    /// Requires the peer to speak the extension protocol. Block indices are
    /// pulled from the shared metadata queue so several clients can fetch
    /// different blocks concurrently.
    fn download_metadata(&mut self) -> Result<()> {
        while self.torrent.incomplete() {
            self.receive()?;

            if !self.peer.supports_extension_protocol() {
                return Err(anyhow!(
                    "client: peer does not support the extension protocol"
                ));
            }

            // wait for the metadata handshake
            if !self.peer.supports_metadata_extension() {
                continue;
            }

            self.request_metadata_pieces()?;

            // block until the remaining pieces arrive, possibly fetched by
            // other clients
            if let Some(wait) = self.torrent.metadata_wait() {
                let _ = wait.recv();
            }
        }

        Ok(())
    }

    fn request_metadata_pieces(&mut self) -> Result<()> {
        while let Some(piece) = self.torrent.metadata_try_recv() {
            let request = message::new_metadata_request(self.peer.metadata_message_id(), piece);

            if let Err(err) = self.send(&request) {
                self.torrent.metadata_return(piece);
                return Err(err);
            }

            if let Err(err) = self.receive_metadata_piece(piece) {
                self.torrent.metadata_return(piece);
                return Err(err);
            }
        }

        Ok(())
    }

    fn receive_metadata_piece(&mut self, piece: usize) -> Result<()> {
        while !self.torrent.metadata_has_piece(piece) {
            self.receive()?;
        }

        Ok(())
    }

    /// Replays HAVE messages buffered during the metadata phase.
    fn flush_have_buffer(&mut self) {
        if self.have_buf.is_empty() {
            return;
        }

        if !self.peer.has_bitfield() && !self.torrent.incomplete() {
            self.peer.init_bitfield(self.torrent.num_pieces());
        }

        for piece in std::mem::take(&mut self.have_buf) {
            self.peer.set_piece(piece);
        }
    }

    /// Pulls pieces off the work queue until it runs dry.
    ///
    /// Pieces the peer does not have go straight back on the queue. A failed
    /// or corrupt piece is reset and re-enqueued for another client.
    fn request_pieces(&mut self, downloaded: &Sender<Piece>) -> Result<()> {
        let mut skipped = 0;

        while let Some(piece) = self.torrent.try_recv_piece() {
            if !self.peer.has_piece(piece.index) {
                self.torrent.return_piece(piece);

                // the peer had none of the queued pieces, wait for HAVE
                // traffic instead of spinning over the queue
                skipped += 1;
                if skipped >= self.torrent.num_pieces().max(1) {
                    skipped = 0;
                    self.receive()?;
                }

                continue;
            }
            skipped = 0;

            if let Err(err) = self.request_piece(piece) {
                if let Some(mut piece) = self.piece.take() {
                    piece.reset();
                    self.torrent.return_piece(piece);
                }
                return Err(err);
            }

            let Some(piece) = self.piece.take() else {
                continue;
            };

            if !self.torrent.is_valid_piece_hash(&piece) {
                warn!("client: piece {} from {} failed its hash check", piece.index, self.peer);
                let mut piece = piece;
                piece.reset();
                self.torrent.return_piece(piece);
                continue;
            }

            debug!("client: piece {} downloaded from {}", piece.index, self.peer);

            if downloaded.send(piece).is_err() {
                return Err(anyhow!("client: could not hand over downloaded piece"));
            }
        }

        Ok(())
    }

    /// Downloads every block of one piece.
    fn request_piece(&mut self, mut piece: Piece) -> Result<()> {
        debug!("client: requesting piece {} from {}", piece.index, self.peer);

        // the buffer is allocated here to keep queued pieces small
        piece.allocate();
        self.piece = Some(piece);

        loop {
            match self.piece.as_ref() {
                Some(piece) if piece.incomplete() => {}
                _ => break,
            }

            if !self.choked {
                self.queue_block_requests()?;
            }

            self.receive()?;
        }

        Ok(())
    }

    /// Keeps the request pipeline filled while the piece allows it.
    fn queue_block_requests(&mut self) -> Result<()> {
        loop {
            let (index, begin, length) = match self.piece.as_ref() {
                Some(piece) if piece.can_queue_request() => {
                    // the last block of a piece might be truncated
                    let length = BLOCK_SIZE.min(piece.length - piece.requested);
                    (piece.index, piece.requested, length)
                }
                _ => return Ok(()),
            };

            self.send_request(index, begin as u32, length as u32)?;

            if let Some(piece) = self.piece.as_mut() {
                piece.requested += length;
                piece.queued_requests += 1;
            }
        }
    }

    /// Reads and dispatches one message.
    ///
    /// Timed-out reads are retried a bounded number of times; a keep-alive
    /// returns without further effect.
    fn receive(&mut self) -> Result<()> {
        let msg = {
            let conn = self.conn()?;
            conn.set_read_timeout(Some(READ_TIMEOUT))?;

            let mut retries = 0;
            let msg = loop {
                let mut reader = conn;
                match message::read(&mut reader) {
                    Ok(msg) => break msg,
                    Err(err) if is_io_timeout(&err) => {
                        retries += 1;
                        if retries >= RECEIVE_RETRIES_MAX {
                            return Err(err).context("client: read timed out");
                        }
                    }
                    Err(err) => {
                        return Err(err).context("client: could not read message from peer")
                    }
                }
            };

            conn.set_read_timeout(None)?;
            msg
        };

        // keep-alive
        let Some(msg) = msg else {
            return Ok(());
        };

        match msg.id {
            message::CHOKE => self.choked = true,
            message::UNCHOKE => self.choked = false,
            message::BITFIELD => self.peer.set_bitfield(msg.payload),
            message::HAVE => self.handle_have_message(&msg)?,
            message::PIECE => self.handle_piece_message(&msg)?,
            message::EXTENDED => self.handle_extended_message(&msg)?,
            _ => {}
        }

        Ok(())
    }

    fn handle_have_message(&mut self, msg: &Message) -> Result<()> {
        let piece = message::parse_have(msg)?;

        // buffer HAVEs received while the manifest is still missing so they
        // can be replayed once the number of pieces is known
        if self.torrent.incomplete() {
            self.have_buf.push(piece);
        }

        if !self.peer.has_bitfield() && !self.torrent.incomplete() {
            self.peer.init_bitfield(self.torrent.num_pieces());
        }

        self.peer.set_piece(piece);
        Ok(())
    }

    fn handle_piece_message(&mut self, msg: &Message) -> Result<()> {
        let block = message::parse_piece_block(msg)?;

        let Some(piece) = self.piece.as_mut() else {
            return Ok(());
        };

        if block.index != piece.index {
            return Err(anyhow!(
                "client: received a block of piece {} while downloading piece {}",
                block.index,
                piece.index
            ));
        }

        let begin = block.begin as usize;
        if begin > piece.data.len() {
            return Err(anyhow!("client: received a block with an invalid offset"));
        }

        let end = (begin + block.data.len()).min(piece.data.len());
        let copied = end - begin;
        piece.data[begin..end].copy_from_slice(&block.data[..copied]);

        piece.received += copied;
        piece.queued_requests = piece.queued_requests.saturating_sub(1);

        Ok(())
    }

    fn handle_extended_message(&mut self, msg: &Message) -> Result<()> {
        if message::is_extension_handshake(msg) {
            let handshake = message::parse_extension_handshake(msg)?;
            self.peer.set_extension_handshake(handshake);

            if self.torrent.incomplete() && self.peer.supports_metadata_extension() {
                self.torrent.ensure_metadata(self.peer.metadata_size());
            }

            return Ok(());
        }

        let msg = message::parse_extension_message(msg)?;

        // only data messages matter, a reject surfaces as a requeue later
        if msg.msg_type == extension::MSG_DATA {
            self.torrent.receive_metadata(&msg)?;
        }

        Ok(())
    }

    fn send_request(&self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send(&message::new_request(index, begin, length))
    }

    fn send_interested(&mut self) -> Result<()> {
        if self.interested {
            return Ok(());
        }

        self.send(&message::new_interested())?;
        self.interested = true;
        Ok(())
    }

    fn send(&self, msg: &Message) -> Result<()> {
        let conn = self.conn()?;
        conn.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let mut writer = conn;
        let result = writer
            .write_all(&msg.bytes())
            .context("client: could not send message to peer");

        conn.set_write_timeout(None)?;
        result
    }

    fn conn(&self) -> Result<&TcpStream> {
        self.conn
            .as_ref()
            .ok_or_else(|| anyhow!("client: not connected"))
    }

    fn shutdown_conn(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.shutdown(Shutdown::Both);
        }
    }

    fn close(&mut self) {
        self.shutdown_conn();
        self.state = State::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{Info, MetaInfo};
    use serde_bencode::ser;
    use serde_bytes::ByteBuf;
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    fn test_torrent() -> Arc<Torrent> {
        let meta = MetaInfo {
            announce: "http://tracker.example/announce".to_string(),
            info: Info {
                name: "artifact.bin".to_string(),
                piece_length: 32768,
                length: 40000,
                pieces: ByteBuf::from(vec![7u8; 40]),
                ..Default::default()
            },
            ..Default::default()
        };
        Arc::new(Torrent::from_bytes(&ser::to_bytes(&meta).unwrap()).unwrap())
    }

    fn serve_handshake(info_hash: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();

            let mut buf = [0u8; 68];
            conn.read_exact(&mut buf).unwrap();

            let reply = Handshake::new(&info_hash, &[3u8; 20]);
            conn.write_all(&reply.bytes()).unwrap();
        });

        port
    }

    #[test]
    fn connect_establishes_handshake() {
        let torrent = test_torrent();
        let port = serve_handshake(torrent.info_hash().to_vec());

        let peer = Peer::new(Ipv4Addr::LOCALHOST, port);
        let mut client = Client::new(peer, torrent);

        client.connect().unwrap();
        assert_eq!(client.state, State::Connected);
        assert!(client.peer.supports_extension_protocol());
    }

    #[test]
    fn connect_rejects_info_hash_mismatch() {
        let torrent = test_torrent();
        let port = serve_handshake(vec![0xAB; 20]);

        let peer = Peer::new(Ipv4Addr::LOCALHOST, port);
        let mut client = Client::new(peer, torrent);

        assert!(client.connect().is_err());
        assert_eq!(client.state, State::Disconnected);
    }

    #[test]
    fn connection_reset_detection() {
        let reset = anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .context("client: could not read message from peer");
        assert!(is_connection_reset(&reset));

        let refused = anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionRefused, "no"));
        assert!(!is_connection_reset(&refused));

        assert!(!is_connection_reset(&anyhow!("plain error")));
    }
}

//! # Tracker Clients
//!
//! Trackers are the rendezvous points of a swarm. An announce tells the
//! tracker what we are downloading and gets back a compact list of peers.
//! Two wire flavors are supported:
//!
//! - **HTTP(S)**: a GET request whose query carries the raw `info_hash` and
//!   `peer_id` bytes percent-encoded, answered with a bencoded dictionary.
//! - **UDP**: the connect/announce two-step with fixed binary packets,
//!   random transaction ids and an exponential retransmission schedule.
//!
//! Any other scheme is rejected. Only the first announce is issued; periodic
//! re-announcement is not part of this client.
//!
//! ## Compact Peers
//!
//! Both flavors return peers as a byte array whose length is a multiple of
//! six: a 4-byte IPv4 address followed by a big-endian 2-byte port per peer.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ByteOrder};
use rand::Rng;
use serde::Deserialize;
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use crate::peer::Peer;
use crate::torrent::Torrent;

// Size of one compact peer entry in bytes
const PEER_SIZE: usize = 6;

// UDP protocol magic constant
const UDP_PROTOCOL_MAGIC: u64 = 0x41727101980;

// UDP action ids
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

// Local ports probed for the UDP socket and announced to both tracker kinds
const PORT_RANGE_START: u16 = 6881;
const PORT_RANGE_END: u16 = 7000;

/// One announce endpoint of the swarm.
pub trait Tracker: Send {
    /// The URL scheme this tracker speaks.
    #[allow(dead_code)]
    fn scheme(&self) -> &str;

    /// Performs one announce round-trip and stores the returned peers.
    fn announce(&mut self) -> Result<()>;

    /// The peers returned by the last announce.
    #[allow(dead_code)]
    fn peers(&self) -> &[Peer];

    /// Moves the announced peers out for dispatching.
    fn take_peers(&mut self) -> Vec<Peer>;

    /// A short description of the tracker for logging.
    fn endpoint(&self) -> String;
}

/// Creates the tracker client matching the URL scheme.
pub fn new(addr: &str, torrent: Arc<Torrent>) -> Result<Box<dyn Tracker>> {
    let url = Url::parse(addr).map_err(|_| anyhow!("tracker: could not parse url {}", addr))?;

    match url.scheme() {
        "udp" => Ok(Box::new(UdpTracker::new(url, torrent))),
        "http" | "https" => Ok(Box::new(HttpTracker::new(url, torrent))),
        scheme => Err(anyhow!("tracker: unsupported scheme '{}'", scheme)),
    }
}

/// Parses a compact peer list into peers.
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<Peer>> {
    if data.len() % PEER_SIZE != 0 {
        return Err(anyhow!("tracker: invalid peer binary length"));
    }

    let peers = data
        .chunks_exact(PEER_SIZE)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = BigEndian::read_u16(&chunk[4..6]);
            Peer::new(ip, port)
        })
        .collect();

    Ok(peers)
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Percent-encodes every byte as `%XX` so binary query values survive any
/// HTTP stack untouched.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}

/// An HTTP(S) announce endpoint.
pub struct HttpTracker {
    url: Url,
    torrent: Arc<Torrent>,
    peers: Vec<Peer>,
    #[allow(dead_code)]
    interval: i64,
    #[allow(dead_code)]
    last_response: Option<Instant>,
    port: u16,
}

/// The bencoded announce response.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct HttpResponse {
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: ByteBuf,
    #[serde(rename = "failure reason", default)]
    failure_reason: String,
    // Unused/optional fields
    #[serde(rename = "tracker id", default)]
    tracker_id: String,
    #[serde(rename = "complete", default)]
    seeders: i64,
    #[serde(rename = "incomplete", default)]
    leechers: i64,
    #[serde(rename = "warning message", default)]
    warning_message: String,
    #[serde(rename = "min interval", default)]
    min_interval: i64,
}

impl HttpTracker {
    pub fn new(url: Url, torrent: Arc<Torrent>) -> HttpTracker {
        HttpTracker {
            url,
            torrent,
            peers: vec![],
            interval: 0,
            last_response: None,
            port: PORT_RANGE_START,
        }
    }

    /// Builds the announce URL with a hand-assembled query string so the
    /// binary `info_hash` and `peer_id` stay exactly `%XX`-encoded.
    fn build_announce_url(&self) -> String {
        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&numwant=50",
            percent_encode_binary(self.torrent.info_hash()),
            percent_encode_binary(self.torrent.peer_id()),
            self.port,
            self.torrent.length()
        );

        let mut url = self.url.to_string();
        if url.contains('?') {
            url.push('&');
        } else {
            url.push('?');
        }
        url.push_str(&query);

        url
    }
}

impl Tracker for HttpTracker {
    fn scheme(&self) -> &str {
        self.url.scheme()
    }

    fn announce(&mut self) -> Result<()> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow!("httptracker: could not build http client: {}", e))?;

        let url = self.build_announce_url();

        let mut retries = 0;
        let response = loop {
            if retries >= 5 {
                return Err(anyhow!("httptracker: announce timed out"));
            }

            match client.get(&url).send() {
                Ok(response) => break response,
                Err(err) if err.is_timeout() => retries += 1,
                Err(err) => return Err(anyhow!("httptracker: announce failed: {}", err)),
            }
        };

        let body = response
            .bytes()
            .map_err(|e| anyhow!("httptracker: could not read announce response: {}", e))?;

        let decoded: HttpResponse = de::from_bytes(&body)
            .map_err(|e| anyhow!("httptracker: could not decode announce response: {}", e))?;

        if !decoded.failure_reason.is_empty() {
            return Err(anyhow!(
                "httptracker: announce failed '{}'",
                decoded.failure_reason
            ));
        }

        self.peers = parse_compact_peers(&decoded.peers)?;
        self.interval = decoded.interval;
        self.last_response = Some(Instant::now());

        Ok(())
    }

    fn peers(&self) -> &[Peer] {
        &self.peers
    }

    fn take_peers(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.peers)
    }

    fn endpoint(&self) -> String {
        self.url.host_str().unwrap_or_default().to_string()
    }
}

/// A UDP announce endpoint.
pub struct UdpTracker {
    url: Url,
    torrent: Arc<Torrent>,
    peers: Vec<Peer>,
    #[allow(dead_code)]
    interval: i64,
    last_response: Option<Instant>,
    port: u16,
    // retransmit counter, the read deadline grows with it
    attempt: u32,
}

impl UdpTracker {
    pub fn new(url: Url, torrent: Arc<Torrent>) -> UdpTracker {
        UdpTracker {
            url,
            torrent,
            peers: vec![],
            interval: 0,
            last_response: None,
            port: PORT_RANGE_START,
            attempt: 0,
        }
    }

    /// Binds a local UDP socket, scanning the client port range and
    /// skipping ports already in use.
    fn bind_socket(&mut self) -> Result<UdpSocket> {
        for port in PORT_RANGE_START..PORT_RANGE_END {
            match UdpSocket::bind(("0.0.0.0", port)) {
                Ok(socket) => {
                    self.port = port;
                    return Ok(socket);
                }
                Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
                Err(err) => return Err(anyhow!("udptracker: could not bind socket: {}", err)),
            }
        }

        Err(anyhow!("udptracker: no port available"))
    }

    fn resolve_remote(&self) -> Result<SocketAddr> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| anyhow!("udptracker: url has no host"))?;
        let port = self
            .url
            .port()
            .ok_or_else(|| anyhow!("udptracker: url has no port"))?;

        format!("{}:{}", host, port)
            .to_socket_addrs()
            .map_err(|e| anyhow!("udptracker: could not resolve {}: {}", host, e))?
            .next()
            .ok_or_else(|| anyhow!("udptracker: could not resolve {}", host))
    }

    fn build_announce_packet(&self, transaction_id: &[u8; 4], connection_id: &[u8; 8]) -> [u8; 98] {
        let mut packet = [0u8; 98];
        packet[0..8].copy_from_slice(connection_id);
        BigEndian::write_u32(&mut packet[8..12], ACTION_ANNOUNCE);
        packet[12..16].copy_from_slice(transaction_id);
        packet[16..36].copy_from_slice(self.torrent.info_hash());
        packet[36..56].copy_from_slice(self.torrent.peer_id());
        BigEndian::write_u64(&mut packet[56..64], 0); // downloaded
        BigEndian::write_u64(&mut packet[64..72], self.torrent.length()); // left
        BigEndian::write_u64(&mut packet[72..80], 0); // uploaded
        BigEndian::write_u32(&mut packet[80..84], 0); // event
        BigEndian::write_u32(&mut packet[84..88], 0); // ip
        BigEndian::write_u32(&mut packet[88..92], 0); // key
        BigEndian::write_u32(&mut packet[92..96], 50); // num want
        BigEndian::write_u16(&mut packet[96..98], self.port); // port
        packet
    }

    /// Reads one datagram under the current retransmission deadline.
    fn receive(&mut self, socket: &UdpSocket) -> io::Result<Vec<u8>> {
        socket.set_read_timeout(Some(retransmit_timeout(self.attempt)))?;
        self.attempt += 1;

        let mut buf = vec![0u8; 512];
        let (read, _) = socket.recv_from(&mut buf)?;
        buf.truncate(read);

        Ok(buf)
    }

    fn connection_expired(&self) -> bool {
        self.last_response
            .is_some_and(|at| at.elapsed() >= Duration::from_secs(60))
    }
}

impl Tracker for UdpTracker {
    fn scheme(&self) -> &str {
        self.url.scheme()
    }

    fn announce(&mut self) -> Result<()> {
        let socket = self.bind_socket()?;
        let raddr = self.resolve_remote()?;
        self.attempt = 0;

        'connect: loop {
            let transaction_id = new_transaction_id();
            let packet = build_connect_packet(&transaction_id);

            let connection_id = loop {
                if self.attempt > 8 {
                    return Err(anyhow!("udptracker: retransmission limit"));
                }

                socket
                    .send_to(&packet, raddr)
                    .map_err(|e| anyhow!("udptracker: could not send connect: {}", e))?;

                match self.receive(&socket) {
                    Ok(buf) => {
                        let connection_id = parse_connect_response(&buf, &transaction_id)?;
                        self.last_response = Some(Instant::now());
                        break connection_id;
                    }
                    Err(err) if is_timeout(&err) => continue,
                    Err(err) => {
                        return Err(anyhow!("udptracker: could not receive connect: {}", err))
                    }
                }
            };

            let transaction_id = new_transaction_id();
            let packet = self.build_announce_packet(&transaction_id, &connection_id);

            loop {
                // a connection id older than a minute is no longer valid
                if self.connection_expired() {
                    continue 'connect;
                }

                if self.attempt > 8 {
                    return Err(anyhow!("udptracker: retransmission limit"));
                }

                socket
                    .send_to(&packet, raddr)
                    .map_err(|e| anyhow!("udptracker: could not send announce: {}", e))?;

                match self.receive(&socket) {
                    Ok(buf) => {
                        let (interval, compact_peers) =
                            parse_announce_response(&buf, &transaction_id)?;

                        self.peers = parse_compact_peers(&compact_peers)?;
                        self.interval = interval as i64;
                        self.last_response = Some(Instant::now());

                        return Ok(());
                    }
                    Err(err) if is_timeout(&err) => continue,
                    Err(err) => {
                        return Err(anyhow!("udptracker: could not receive announce: {}", err))
                    }
                }
            }
        }
    }

    fn peers(&self) -> &[Peer] {
        &self.peers
    }

    fn take_peers(&mut self) -> Vec<Peer> {
        std::mem::take(&mut self.peers)
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

/// The read deadline before retransmit number `attempt`.
fn retransmit_timeout(attempt: u32) -> Duration {
    Duration::from_secs(15 << attempt)
}

fn new_transaction_id() -> [u8; 4] {
    let mut transaction_id = [0u8; 4];
    rand::thread_rng().fill(&mut transaction_id);
    transaction_id
}

fn build_connect_packet(transaction_id: &[u8; 4]) -> [u8; 16] {
    let mut packet = [0u8; 16];
    BigEndian::write_u64(&mut packet[0..8], UDP_PROTOCOL_MAGIC);
    BigEndian::write_u32(&mut packet[8..12], ACTION_CONNECT);
    packet[12..16].copy_from_slice(transaction_id);
    packet
}

fn parse_connect_response(buf: &[u8], transaction_id: &[u8; 4]) -> Result<[u8; 8]> {
    if buf.len() < 16 {
        return Err(anyhow!("udptracker: connect response was too small"));
    }

    if &buf[4..8] != transaction_id {
        return Err(anyhow!(
            "udptracker: received an invalid connect transaction id"
        ));
    }

    if BigEndian::read_u32(&buf[0..4]) != ACTION_CONNECT {
        return Err(anyhow!("udptracker: received an invalid connect action"));
    }

    let mut connection_id = [0u8; 8];
    connection_id.copy_from_slice(&buf[8..16]);
    Ok(connection_id)
}

fn parse_announce_response(buf: &[u8], transaction_id: &[u8; 4]) -> Result<(u32, Vec<u8>)> {
    if buf.len() < 20 {
        return Err(anyhow!("udptracker: announce response was too small"));
    }

    if &buf[4..8] != transaction_id {
        return Err(anyhow!(
            "udptracker: received an invalid announce transaction id"
        ));
    }

    if BigEndian::read_u32(&buf[0..4]) != ACTION_ANNOUNCE {
        return Err(anyhow!("udptracker: received an invalid announce action"));
    }

    let interval = BigEndian::read_u32(&buf[8..12]);
    Ok((interval, buf[20..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{Info, MetaInfo};
    use serde_bencode::ser;
    use serde_bytes::ByteBuf;

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

    #[test]
    fn compact_peers_parse() {
        let data = [10, 0, 0, 1, 0x1A, 0xE1, 192, 168, 1, 2, 0x1A, 0xE9];
        let peers = parse_compact_peers(&data).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "10.0.0.1:6881");
        assert_eq!(peers[1].to_string(), "192.168.1.2:6889");
    }

    #[test]
    fn compact_peers_invalid_length() {
        assert!(parse_compact_peers(&[0; 7]).is_err());
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn binary_query_values_are_fully_encoded() {
        assert_eq!(percent_encode_binary(&[0x00, 0x10, 0xFF]), "%00%10%FF");
        assert_eq!(percent_encode_binary(b"AZ"), "%41%5A");
    }

    #[test]
    fn announce_url_carries_the_announce_params() {
        let tracker = HttpTracker::new(
            Url::parse("http://tracker.example/announce").unwrap(),
            test_torrent(),
        );

        let url = tracker.build_announce_url();
        assert!(url.starts_with("http://tracker.example/announce?info_hash=%"));
        assert!(url.contains("&port=6881&"));
        assert!(url.contains("&uploaded=0&downloaded=0&left=40000&compact=1&numwant=50"));
    }

    #[test]
    fn scheme_dispatch() {
        let torrent = test_torrent();

        assert_eq!(
            tracker_scheme(new("udp://tracker.example:6969", torrent.clone()).unwrap()),
            "udp"
        );
        assert_eq!(
            tracker_scheme(new("https://tracker.example/announce", torrent.clone()).unwrap()),
            "https"
        );
        assert!(new("wss://tracker.example", torrent).is_err());
    }

    fn tracker_scheme(tracker: Box<dyn Tracker>) -> String {
        tracker.scheme().to_string()
    }

    #[test]
    fn connect_packet_layout() {
        let packet = build_connect_packet(&[1, 2, 3, 4]);
        assert_eq!(&packet[0..8], &[0, 0, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80]);
        assert_eq!(&packet[8..12], &[0, 0, 0, 0]);
        assert_eq!(&packet[12..16], &[1, 2, 3, 4]);
    }

    #[test]
    fn announce_packet_layout() {
        let torrent = test_torrent();
        let tracker = UdpTracker::new(Url::parse("udp://tracker.example:6969").unwrap(), torrent.clone());

        let packet = tracker.build_announce_packet(&[1, 2, 3, 4], &[9; 8]);
        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[0..8], &[9; 8]);
        assert_eq!(BigEndian::read_u32(&packet[8..12]), ACTION_ANNOUNCE);
        assert_eq!(&packet[12..16], &[1, 2, 3, 4]);
        assert_eq!(&packet[16..36], torrent.info_hash());
        assert_eq!(&packet[36..56], torrent.peer_id());
        assert_eq!(BigEndian::read_u64(&packet[64..72]), 40000); // left
        assert_eq!(BigEndian::read_u32(&packet[92..96]), 50); // num want
        assert_eq!(BigEndian::read_u16(&packet[96..98]), PORT_RANGE_START);
    }

    #[test]
    fn connect_response_validation() {
        let mut buf = [0u8; 16];
        buf[4..8].copy_from_slice(&[1, 2, 3, 4]);
        buf[8..16].copy_from_slice(&[5; 8]);

        assert_eq!(parse_connect_response(&buf, &[1, 2, 3, 4]).unwrap(), [5; 8]);

        // echoed transaction id differs
        assert!(parse_connect_response(&buf, &[9, 9, 9, 9]).is_err());

        // wrong action
        BigEndian::write_u32(&mut buf[0..4], ACTION_ANNOUNCE);
        assert!(parse_connect_response(&buf, &[1, 2, 3, 4]).is_err());

        // truncated
        assert!(parse_connect_response(&buf[..10], &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn announce_response_validation() {
        let mut buf = vec![0u8; 26];
        BigEndian::write_u32(&mut buf[0..4], ACTION_ANNOUNCE);
        buf[4..8].copy_from_slice(&[1, 2, 3, 4]);
        BigEndian::write_u32(&mut buf[8..12], 1800);
        buf[20..26].copy_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1]);

        let (interval, peers) = parse_announce_response(&buf, &[1, 2, 3, 4]).unwrap();
        assert_eq!(interval, 1800);
        assert_eq!(peers.len(), 6);

        assert!(parse_announce_response(&buf, &[9, 9, 9, 9]).is_err());
        assert!(parse_announce_response(&buf[..12], &[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn retransmit_schedule_doubles() {
        assert_eq!(retransmit_timeout(0), Duration::from_secs(15));
        assert_eq!(retransmit_timeout(1), Duration::from_secs(30));
        assert_eq!(retransmit_timeout(2), Duration::from_secs(60));
        assert_eq!(retransmit_timeout(8), Duration::from_secs(3840));
    }
}

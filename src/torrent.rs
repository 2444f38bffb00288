//! # Torrent Model
//!
//! This module owns everything derived from a `.torrent` file or magnet URI:
//! the parsed metainfo records, the info-hash that identifies the torrent,
//! the locally generated peer id, the piece work queue and the metadata
//! assembly buffer for magnet downloads.
//!
//! ## Metainfo Records
//!
//! A torrent file is a bencoded dictionary:
//!
//! - **announce** / **announce-list**: tracker URLs, the list grouped in tiers
//! - **info**: the content manifest with `name`, `piece length`, the
//!   concatenated 20-byte SHA-1 piece hashes, and either `length`
//!   (single-file mode) or `files` (multi-file mode)
//!
//! The info-hash is the SHA-1 of the re-encoded info dictionary. Encoding is
//! deterministic because bencode dictionaries serialize their keys in
//! ascending byte order, so the hash is reproducible across clients.
//!
//! ## Magnet Links
//!
//! A magnet URI carries only the info-hash, a display name and tracker URLs.
//! The resulting torrent starts out incomplete; the info dictionary itself
//! is fetched from peers via the metadata extension, and the piece queue is
//! populated once it arrives.
//!
//! ## Piece Work Queue
//!
//! Pieces are seeded onto a bounded channel in random order. Peer clients
//! pull pieces, download them, and either push them to the manager on
//! success or put them back on the queue on failure.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use url::Url;

use crate::extension::ExtensionMessage;
use crate::metadata::Metadata;
use crate::piece::{Destination, Piece};

// Size of a SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

// Client tag leading every generated peer id
const CLIENT_TAG: &[u8] = b"-TM0001-";

fn is_zero_u64(n: &u64) -> bool {
    *n == 0
}

fn is_zero_i64(n: &i64) -> bool {
    *n == 0
}

fn is_empty_bytes(b: &ByteBuf) -> bool {
    b.is_empty()
}

/// One file entry of a multi-file torrent.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoFile {
    /// File size in bytes.
    #[serde(default)]
    pub length: u64,
    /// Path components below the torrent's root directory.
    #[serde(default)]
    pub path: Vec<String>,
}

/// The torrent's content manifest.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    /// File list, present in multi-file mode only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<InfoFile>,
    /// Content size in bytes, present in single-file mode only.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub length: u64,
    /// File name or directory name to download into.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Bytes per piece, except possibly the last.
    #[serde(rename = "piece length", default, skip_serializing_if = "is_zero_u64")]
    pub piece_length: u64,
    /// Concatenated 20-byte SHA-1 hashes, one per piece.
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub pieces: ByteBuf,
    /// Private tracker flag, carried through for hash fidelity.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub private: i64,
}

/// The top-level dictionary of a `.torrent` file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaInfo {
    /// Tracker tiers, each a list of URLs.
    #[serde(rename = "announce-list", default, skip_serializing_if = "Vec::is_empty")]
    pub announce_list: Vec<Vec<String>>,
    /// Primary tracker URL.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub announce: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(rename = "created by", default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(rename = "creation date", default, skip_serializing_if = "is_zero_i64")]
    pub creation_date: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encoding: String,
    /// The content manifest.
    pub info: Info,
}

impl Info {
    /// Hashes the re-encoded info dictionary to identify the torrent.
    fn hash(&self) -> Result<Vec<u8>> {
        let buf = ser::to_bytes(self)
            .map_err(|e| anyhow!("torrent: could not encode info: {}", e))?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finish().to_vec())
    }

    /// Total content size across both file modes.
    fn total_length(&self) -> u64 {
        if self.length > 0 {
            return self.length;
        }

        self.files.iter().map(|file| file.length).sum()
    }
}

impl MetaInfo {
    /// A metainfo is incomplete until it carries piece hashes and a piece
    /// length, which is the case for magnet links before metadata retrieval.
    pub fn incomplete(&self) -> bool {
        self.info.pieces.is_empty() || self.info.piece_length == 0
    }
}

type PieceQueue = (Sender<Piece>, Receiver<Piece>);

/// A torrent being downloaded, shared between the manager and every peer
/// client working on it.
pub struct Torrent {
    meta: Mutex<MetaInfo>,
    info_hash: Vec<u8>,
    peer_id: Vec<u8>,
    pieces: Mutex<Option<PieceQueue>>,
    metadata: Mutex<Option<Metadata>>,
    // cache of the total size, multi-file torrents would otherwise sum on
    // every progress update
    length: AtomicU64,
}

impl Torrent {
    /// Opens a torrent from a `.torrent` file path or a magnet URI.
    pub fn open(source: &str) -> Result<Torrent> {
        if source.starts_with("magnet:") {
            return Torrent::from_magnet(source);
        }

        let mut file =
            File::open(source).map_err(|_| anyhow!("torrent: could not open {}", source))?;

        let mut buf = vec![];
        file.read_to_end(&mut buf)
            .map_err(|_| anyhow!("torrent: could not read {}", source))?;

        Torrent::from_bytes(&buf)
    }

    /// Parses the bencoded contents of a `.torrent` file.
    pub fn from_bytes(data: &[u8]) -> Result<Torrent> {
        let meta: MetaInfo =
            de::from_bytes(data).map_err(|_| anyhow!("torrent: could not decode torrent"))?;

        let info_hash = meta.info.hash()?;
        let torrent = Torrent::from_parts(meta, info_hash);

        torrent.populate_piece_channel();
        torrent.cache_length();

        Ok(torrent)
    }

    /// Creates an incomplete torrent from a magnet URI.
    ///
    /// The `xt`, `dn` and at least one `tr` parameter are required; the
    /// `xt` value must be a `urn:btih:` prefixed 40-digit hex info-hash.
    fn from_magnet(link: &str) -> Result<Torrent> {
        let url = Url::parse(link).map_err(|_| anyhow!("torrent: could not parse magnet link"))?;

        let mut xt = None;
        let mut name = None;
        let mut trackers: Vec<String> = vec![];

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => xt = Some(value.into_owned()),
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let xt = xt.ok_or_else(|| anyhow!("torrent: missing magnet link param 'xt'"))?;
        let name = name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("torrent: missing magnet link param 'dn'"))?;

        if trackers.is_empty() {
            return Err(anyhow!("torrent: missing magnet link param 'tr'"));
        }

        let hash_hex = xt
            .strip_prefix("urn:btih:")
            .ok_or_else(|| anyhow!("torrent: invalid prefix for param 'xt', got {}", xt))?;

        let info_hash =
            hex::decode(hash_hex).map_err(|_| anyhow!("torrent: unable to decode info hash"))?;

        if info_hash.len() != SHA1_HASH_SIZE {
            return Err(anyhow!("torrent: info hash is not 20 bytes"));
        }

        let announce_list: Vec<Vec<String>> =
            trackers.iter().map(|tracker| vec![tracker.clone()]).collect();

        let meta = MetaInfo {
            announce: trackers[0].clone(),
            announce_list,
            info: Info {
                name,
                ..Default::default()
            },
            ..Default::default()
        };

        Ok(Torrent::from_parts(meta, info_hash))
    }

    fn from_parts(meta: MetaInfo, info_hash: Vec<u8>) -> Torrent {
        Torrent {
            meta: Mutex::new(meta),
            info_hash,
            peer_id: generate_peer_id(),
            pieces: Mutex::new(None),
            metadata: Mutex::new(None),
            length: AtomicU64::new(0),
        }
    }

    /// The name to download into, from the manifest or the magnet link.
    pub fn name(&self) -> String {
        self.meta.lock().unwrap().info.name.clone()
    }

    /// Total content size in bytes, zero until the manifest is known.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    /// Number of pieces in the manifest.
    pub fn num_pieces(&self) -> usize {
        self.meta.lock().unwrap().info.pieces.len() / SHA1_HASH_SIZE
    }

    /// Returns true while the info dictionary still has to be fetched.
    pub fn incomplete(&self) -> bool {
        self.meta.lock().unwrap().incomplete()
    }

    /// The 20-byte torrent identifier.
    pub fn info_hash(&self) -> &[u8] {
        &self.info_hash
    }

    /// Our 20-byte peer id, client tag plus random suffix.
    pub fn peer_id(&self) -> &[u8] {
        &self.peer_id
    }

    /// Tracker URLs to announce to, the first URL of every tier.
    pub fn trackers(&self) -> Vec<String> {
        let meta = self.meta.lock().unwrap();

        if meta.announce_list.is_empty() {
            if meta.announce.is_empty() {
                return vec![];
            }

            return vec![meta.announce.clone()];
        }

        meta.announce_list
            .iter()
            .filter(|tier| !tier.is_empty())
            .map(|tier| tier[0].clone())
            .collect()
    }

    /// The expected SHA-1 hash for one piece, if the index is in range.
    pub fn piece_hash(&self, index: u32) -> Option<Vec<u8>> {
        let meta = self.meta.lock().unwrap();
        let begin = index as usize * SHA1_HASH_SIZE;
        let end = begin + SHA1_HASH_SIZE;

        if end > meta.info.pieces.len() {
            return None;
        }

        Some(meta.info.pieces[begin..end].to_vec())
    }

    /// Verifies a downloaded piece against its manifest hash.
    pub fn is_valid_piece_hash(&self, piece: &Piece) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&piece.data);
        let hash = hasher.finish().to_vec();

        self.piece_hash(piece.index)
            .is_some_and(|expected| expected == hash)
    }

    /// Takes a piece off the work queue without blocking.
    pub fn try_recv_piece(&self) -> Option<Piece> {
        let guard = self.pieces.lock().unwrap();
        let (_, receiver) = guard.as_ref()?;
        receiver.try_recv().ok()
    }

    /// Puts a piece back on the work queue for another client.
    pub fn return_piece(&self, piece: Piece) {
        let guard = self.pieces.lock().unwrap();
        if let Some((sender, _)) = guard.as_ref() {
            // the queue was sized for every piece, this cannot block
            let _ = sender.send(piece);
        }
    }

    /// Creates the metadata buffer once a peer has reported its size.
    pub fn ensure_metadata(&self, size: usize) {
        let mut guard = self.metadata.lock().unwrap();
        if guard.is_none() && size > 0 {
            *guard = Some(Metadata::new(size));
        }
    }

    /// Takes a pending metadata block index, if any.
    pub fn metadata_try_recv(&self) -> Option<usize> {
        self.metadata.lock().unwrap().as_ref()?.try_recv_piece()
    }

    /// Returns a metadata block index to the pending queue.
    pub fn metadata_return(&self, piece: usize) {
        if let Some(metadata) = self.metadata.lock().unwrap().as_ref() {
            metadata.return_piece(piece);
        }
    }

    /// Returns true if the metadata block has been received.
    pub fn metadata_has_piece(&self, piece: usize) -> bool {
        self.metadata
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|metadata| metadata.has_piece(piece))
    }

    /// A channel that unblocks once the metadata is complete.
    pub fn metadata_wait(&self) -> Option<Receiver<()>> {
        self.metadata
            .lock()
            .unwrap()
            .as_ref()
            .map(Metadata::wait_channel)
    }

    /// Feeds a metadata data message into the buffer.
    ///
    /// When the last block arrives the info dictionary is decoded, the
    /// manifest becomes complete, the piece queue is populated and the
    /// completion channel is closed.
    pub fn receive_metadata(&self, msg: &ExtensionMessage) -> Result<()> {
        let mut guard = self.metadata.lock().unwrap();
        let Some(metadata) = guard.as_mut() else {
            return Ok(());
        };

        metadata.receive(msg);

        if metadata.complete() && self.incomplete() {
            let info: Info = de::from_bytes(metadata.data())
                .map_err(|e| anyhow!("torrent: could not decode metadata: {}", e))?;

            self.meta.lock().unwrap().info = info;
            self.populate_piece_channel();
            self.cache_length();
            metadata.close_wait();
        }

        Ok(())
    }

    /// Seeds the work queue with every piece of the manifest, shuffled.
    fn populate_piece_channel(&self) {
        let mut pieces = {
            let meta = self.meta.lock().unwrap();
            if meta.incomplete() {
                return;
            }

            build_pieces(&meta.info)
        };

        pieces.shuffle(&mut rand::thread_rng());

        let queue = bounded(pieces.len());
        for piece in pieces {
            let _ = queue.0.send(piece);
        }

        *self.pieces.lock().unwrap() = Some(queue);
    }

    fn cache_length(&self) {
        let meta = self.meta.lock().unwrap();
        self.length.store(meta.info.total_length(), Ordering::Relaxed);
    }
}

fn generate_peer_id() -> Vec<u8> {
    let mut buf = vec![0u8; 20];
    buf[..CLIENT_TAG.len()].copy_from_slice(CLIENT_TAG);

    let mut rng = rand::thread_rng();
    for x in buf[CLIENT_TAG.len()..].iter_mut() {
        *x = rng.gen();
    }

    buf
}

/// Builds every piece of the manifest together with its write plan.
fn build_pieces(info: &Info) -> Vec<Piece> {
    let nb_pieces = info.pieces.len() / SHA1_HASH_SIZE;
    let total = info.total_length();

    let mut pieces = Vec::with_capacity(nb_pieces);
    for index in 0..nb_pieces {
        let offset = index as u64 * info.piece_length;
        // last piece might be truncated
        let length = info.piece_length.min(total.saturating_sub(offset)) as usize;

        pieces.push(Piece::new(
            index as u32,
            length,
            offset,
            destinations(info, offset, length),
        ));
    }

    pieces
}

/// Calculates where a piece's data is written, splitting it at every file
/// boundary that falls inside the piece.
fn destinations(info: &Info, offset: u64, length: usize) -> Vec<Destination> {
    // single-file mode writes the whole piece into the one file
    if info.files.is_empty() {
        return vec![Destination {
            path: PathBuf::from(&info.name),
            offset,
            start: 0,
            end: length,
        }];
    }

    let piece_end = offset + length as u64;
    let mut destinations = Vec::new();
    let mut file_start = 0u64;

    for file in &info.files {
        let file_end = file_start + file.length;

        // intersection of the piece range with this file's range
        let begin = offset.max(file_start);
        let end = piece_end.min(file_end);

        if begin < end {
            let mut path = PathBuf::from(&info.name);
            for part in &file.path {
                path.push(part);
            }

            destinations.push(Destination {
                path,
                offset: begin - file_start,
                start: (begin - offset) as usize,
                end: (end - offset) as usize,
            });
        }

        file_start = file_end;
    }

    destinations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_meta() -> MetaInfo {
        MetaInfo {
            announce: "http://tracker.example/announce".to_string(),
            info: Info {
                name: "artifact.bin".to_string(),
                piece_length: 32768,
                length: 40000,
                pieces: ByteBuf::from(vec![7u8; 40]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn multi_file_info() -> Info {
        Info {
            name: "bundle".to_string(),
            piece_length: 32768,
            pieces: ByteBuf::from(vec![0u8; 60]),
            files: vec![
                InfoFile {
                    length: 40000,
                    path: vec!["f1".to_string()],
                },
                InfoFile {
                    length: 25768,
                    path: vec!["sub".to_string(), "f2".to_string()],
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn open_single_file_torrent() {
        let data = ser::to_bytes(&single_file_meta()).unwrap();
        let torrent = Torrent::from_bytes(&data).unwrap();

        assert_eq!(torrent.name(), "artifact.bin");
        assert_eq!(torrent.length(), 40000);
        assert_eq!(torrent.num_pieces(), 2);
        assert!(!torrent.incomplete());
        assert_eq!(torrent.info_hash().len(), 20);
        assert_eq!(torrent.trackers(), vec!["http://tracker.example/announce"]);
    }

    #[test]
    fn peer_id_carries_client_tag() {
        let data = ser::to_bytes(&single_file_meta()).unwrap();
        let torrent = Torrent::from_bytes(&data).unwrap();

        assert_eq!(torrent.peer_id().len(), 20);
        assert_eq!(&torrent.peer_id()[..8], b"-TM0001-");
    }

    #[test]
    fn marshal_sorts_keys_and_omits_empty_fields() {
        let info = Info {
            name: "test".to_string(),
            piece_length: 32768,
            length: 100,
            pieces: ByteBuf::from(vec![1u8; 20]),
            ..Default::default()
        };

        let mut expected = b"d6:lengthi100e4:name4:test12:piece lengthi32768e6:pieces20:".to_vec();
        expected.extend_from_slice(&[1u8; 20]);
        expected.push(b'e');

        assert_eq!(ser::to_bytes(&info).unwrap(), expected);
    }

    #[test]
    fn marshal_unmarshal_roundtrip() {
        let original = multi_file_info();
        let encoded = ser::to_bytes(&original).unwrap();
        let decoded: Info = de::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn piece_queue_holds_every_piece() {
        let data = ser::to_bytes(&single_file_meta()).unwrap();
        let torrent = Torrent::from_bytes(&data).unwrap();

        let first = torrent.try_recv_piece().unwrap();
        let second = torrent.try_recv_piece().unwrap();
        assert!(torrent.try_recv_piece().is_none());

        assert_eq!(first.length + second.length, 40000);

        torrent.return_piece(first);
        assert!(torrent.try_recv_piece().is_some());
    }

    #[test]
    fn destinations_cover_the_whole_torrent() {
        let info = multi_file_info();
        let pieces = build_pieces(&info);

        let covered: usize = pieces
            .iter()
            .flat_map(|piece| &piece.destinations)
            .map(|dst| dst.end - dst.start)
            .sum();

        assert_eq!(covered as u64, info.total_length());
    }

    #[test]
    fn middle_piece_splits_at_file_boundary() {
        let pieces = build_pieces(&multi_file_info());
        let middle = &pieces[1];

        assert_eq!(middle.destinations.len(), 2);
        assert_eq!(
            middle.destinations[0],
            Destination {
                path: PathBuf::from("bundle/f1"),
                offset: 32768,
                start: 0,
                end: 7232,
            }
        );
        assert_eq!(
            middle.destinations[1],
            Destination {
                path: PathBuf::from("bundle/sub/f2"),
                offset: 0,
                start: 7232,
                end: 32768,
            }
        );
    }

    #[test]
    fn piece_spanning_three_files() {
        let info = Info {
            name: "bundle".to_string(),
            piece_length: 32768,
            pieces: ByteBuf::from(vec![0u8; 20]),
            files: vec![
                InfoFile {
                    length: 10000,
                    path: vec!["a".to_string()],
                },
                InfoFile {
                    length: 10000,
                    path: vec!["b".to_string()],
                },
                InfoFile {
                    length: 12768,
                    path: vec!["c".to_string()],
                },
            ],
            ..Default::default()
        };

        let pieces = build_pieces(&info);
        let dsts = &pieces[0].destinations;

        assert_eq!(dsts.len(), 3);
        assert_eq!((dsts[0].offset, dsts[0].start, dsts[0].end), (0, 0, 10000));
        assert_eq!((dsts[1].offset, dsts[1].start, dsts[1].end), (0, 10000, 20000));
        assert_eq!((dsts[2].offset, dsts[2].start, dsts[2].end), (0, 20000, 32768));
    }

    #[test]
    fn piece_hash_verification() {
        let mut data = ser::to_bytes(&single_file_meta()).unwrap();
        let torrent = Torrent::from_bytes(&data).unwrap();

        let mut piece = Piece::new(0, 5, 0, vec![]);
        piece.data = b"hello".to_vec();
        assert!(!torrent.is_valid_piece_hash(&piece));

        // rebuild the torrent with the real hash of "hello" as piece 0
        let mut hasher = Sha1::new();
        hasher.update(b"hello");
        let digest = hasher.finish();

        let mut meta = single_file_meta();
        meta.info.pieces[..20].copy_from_slice(&digest);
        data = ser::to_bytes(&meta).unwrap();
        let torrent = Torrent::from_bytes(&data).unwrap();

        assert!(torrent.is_valid_piece_hash(&piece));
    }

    #[test]
    fn piece_hash_out_of_range() {
        let data = ser::to_bytes(&single_file_meta()).unwrap();
        let torrent = Torrent::from_bytes(&data).unwrap();

        assert!(torrent.piece_hash(1).is_some());
        assert!(torrent.piece_hash(2).is_none());
    }

    #[test]
    fn magnet_link_parses() {
        let link = "magnet:?xt=urn:btih:dd02dc8713ca6edfc7dd21d0bf5da58834559a7c\
                    &dn=bilder&tr=udp%3A%2F%2Ftracker.example.org%3A6969\
                    &tr=http%3A%2F%2Fbackup.example.org%2Fannounce";

        let torrent = Torrent::open(link).unwrap();
        assert!(torrent.incomplete());
        assert_eq!(torrent.name(), "bilder");
        assert_eq!(torrent.length(), 0);
        assert_eq!(
            torrent.info_hash(),
            hex::decode("dd02dc8713ca6edfc7dd21d0bf5da58834559a7c").unwrap()
        );
        assert_eq!(
            torrent.trackers(),
            vec![
                "udp://tracker.example.org:6969",
                "http://backup.example.org/announce"
            ]
        );
        assert!(torrent.try_recv_piece().is_none());
    }

    #[test]
    fn magnet_link_missing_params() {
        assert!(Torrent::open("magnet:?dn=x&tr=udp://t:1").is_err());
        assert!(Torrent::open("magnet:?xt=urn:btih:dd02dc8713ca6edfc7dd21d0bf5da58834559a7c&tr=udp://t:1").is_err());
        assert!(Torrent::open("magnet:?xt=urn:btih:dd02dc8713ca6edfc7dd21d0bf5da58834559a7c&dn=x").is_err());
        assert!(Torrent::open("magnet:?xt=urn:btih:zz02&dn=x&tr=udp://t:1").is_err());
        assert!(Torrent::open("magnet:?xt=urn:sha1:dd02dc8713ca6edfc7dd21d0bf5da58834559a7c&dn=x&tr=udp://t:1").is_err());
    }

    #[test]
    fn metadata_completion_populates_pieces() {
        let meta_bytes = ser::to_bytes(&single_file_meta().info).unwrap();

        let link = "magnet:?xt=urn:btih:dd02dc8713ca6edfc7dd21d0bf5da58834559a7c\
                    &dn=artifact.bin&tr=udp%3A%2F%2Ftracker.example.org%3A6969";
        let torrent = Torrent::open(link).unwrap();

        torrent.ensure_metadata(meta_bytes.len());
        assert_eq!(torrent.metadata_try_recv(), Some(0));
        assert!(torrent.metadata_try_recv().is_none());

        let wait = torrent.metadata_wait().unwrap();

        let msg = ExtensionMessage {
            id: 1,
            msg_type: 1,
            piece: 0,
            total_size: meta_bytes.len() as i64,
            data: meta_bytes,
        };
        torrent.receive_metadata(&msg).unwrap();

        assert!(!torrent.incomplete());
        assert!(torrent.metadata_has_piece(0));
        assert_eq!(torrent.length(), 40000);
        assert_eq!(torrent.num_pieces(), 2);
        assert!(torrent.try_recv_piece().is_some());
        // completion closed the wait channel
        assert!(wait.recv().is_err());
    }
}

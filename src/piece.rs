//! # Torrent Pieces
//!
//! A piece is one hash-verified unit of the torrent content. Pieces travel
//! through the work queue to a peer client, collect their blocks, and once
//! verified are handed to the disk writer.
//!
//! Because files in a multi-file torrent are laid out back to back, a piece
//! can straddle file boundaries. The write plan for a piece is a list of
//! destinations, each copying a contiguous sub-range of the piece buffer to
//! an offset within one file.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};

/// Number of block requests kept in flight per piece.
pub const MAX_QUEUED_REQUESTS: usize = 5;

/// Where a sub-range of a piece gets written on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Target file, relative to the working directory.
    pub path: PathBuf,
    /// Byte offset within the target file.
    pub offset: u64,
    /// Start of the sub-range within the piece buffer.
    pub start: usize,
    /// End of the sub-range within the piece buffer.
    pub end: usize,
}

/// One block of a piece as carried by a PIECE message.
#[derive(Debug)]
pub struct Block {
    /// Piece index the block belongs to.
    pub index: u32,
    /// Byte offset of the block within its piece.
    pub begin: u32,
    /// Block payload.
    pub data: Vec<u8>,
}

/// One piece of the torrent content and its download state.
#[derive(Debug)]
pub struct Piece {
    /// Zero-based piece index.
    pub index: u32,
    /// Piece length in bytes, truncated for the last piece.
    pub length: usize,
    /// Byte offset of the piece in the logical content stream.
    pub offset: u64,
    /// Download buffer, allocated when a client picks the piece up.
    pub data: Vec<u8>,
    /// Bytes received so far.
    pub received: usize,
    /// Bytes requested so far.
    pub requested: usize,
    /// Block requests currently in flight.
    pub queued_requests: usize,
    /// Write plan for the piece data.
    pub destinations: Vec<Destination>,
}

impl Piece {
    pub fn new(index: u32, length: usize, offset: u64, destinations: Vec<Destination>) -> Piece {
        Piece {
            index,
            length,
            offset,
            data: Vec::new(),
            received: 0,
            requested: 0,
            queued_requests: 0,
            destinations,
        }
    }

    /// Returns true while blocks are still missing.
    pub fn incomplete(&self) -> bool {
        self.received < self.length
    }

    /// Returns true if another block request may be queued.
    pub fn can_queue_request(&self) -> bool {
        self.requested < self.length && self.queued_requests < MAX_QUEUED_REQUESTS
    }

    /// Allocates the download buffer. Deferred until a client actually
    /// starts on the piece to keep idle queue entries small.
    pub fn allocate(&mut self) {
        self.data = vec![0; self.length];
    }

    /// Clears all download state so another client can retry the piece.
    pub fn reset(&mut self) {
        self.data = Vec::new();
        self.received = 0;
        self.requested = 0;
        self.queued_requests = 0;
    }

    /// Writes the piece data to every destination in its write plan.
    ///
    /// Parent directories are created on first use. Files are opened for
    /// writing without truncation since many pieces share a file.
    pub fn write(&self) -> Result<()> {
        for dst in &self.destinations {
            if let Some(parent) = dst.path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("piece: could not create directory {:?}: {}", parent, e)
                })?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&dst.path)
                .map_err(|e| anyhow!("piece: could not open {:?}: {}", dst.path, e))?;

            file.seek(SeekFrom::Start(dst.offset))?;
            file.write_all(&self.data[dst.start..dst.end])?;
        }

        Ok(())
    }
}

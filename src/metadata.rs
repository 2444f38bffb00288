//! # Metadata Buffer
//!
//! Assembles the torrent's info dictionary from `ut_metadata` blocks when the
//! download started from a magnet link. Blocks are 16 KiB, indexed from zero,
//! with the last one possibly shorter. Any connected peer that supports the
//! metadata extension may contribute blocks; the pending block indices live
//! on a channel so peers can steal work from each other.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::bitfield::Bitfield;
use crate::extension::ExtensionMessage;

/// Size of one metadata block in bytes.
pub const BLOCK_SIZE: usize = 16384;

/// The in-progress metadata download for one torrent.
pub struct Metadata {
    /// Assembly buffer sized to the reported metadata size.
    data: Vec<u8>,
    /// Bytes written so far.
    written: usize,
    /// Which blocks have been received.
    received: Bitfield,
    /// Pending block indices, drained by peer clients.
    pieces: (Sender<usize>, Receiver<usize>),
    /// Dropped once when the metadata is complete, waking all waiters.
    wait_tx: Option<Sender<()>>,
    wait_rx: Receiver<()>,
}

impl Metadata {
    /// Creates a buffer for `size` bytes of metadata and seeds the block
    /// queue with every index to fetch.
    pub fn new(size: usize) -> Metadata {
        let nb_blocks = size.div_ceil(BLOCK_SIZE);
        let pieces = bounded(nb_blocks);

        for piece in 0..nb_blocks {
            // the channel was sized to hold them all
            let _ = pieces.0.send(piece);
        }

        let (wait_tx, wait_rx) = bounded(1);

        Metadata {
            data: vec![0; size],
            written: 0,
            received: Bitfield::sized(nb_blocks),
            pieces,
            wait_tx: Some(wait_tx),
            wait_rx,
        }
    }

    /// Copies a received block into the buffer at its offset.
    ///
    /// Duplicate blocks are ignored so the written-byte count stays honest.
    pub fn receive(&mut self, msg: &ExtensionMessage) {
        if msg.piece < 0 {
            return;
        }

        let piece = msg.piece as usize;
        if self.received.has_piece(piece) {
            return;
        }

        let offset = piece * BLOCK_SIZE;
        if offset >= self.data.len() {
            return;
        }

        let end = (offset + msg.data.len()).min(self.data.len());
        let copied = end - offset;
        self.data[offset..end].copy_from_slice(&msg.data[..copied]);

        self.written += copied;
        self.received.set_piece(piece);
    }

    /// Returns true if the block has already been received.
    pub fn has_piece(&self, piece: usize) -> bool {
        self.received.has_piece(piece)
    }

    /// Returns true once every byte of the metadata has been written.
    pub fn complete(&self) -> bool {
        self.written == self.data.len()
    }

    /// The assembled metadata bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Takes a pending block index off the queue, if any.
    pub fn try_recv_piece(&self) -> Option<usize> {
        self.pieces.1.try_recv().ok()
    }

    /// Puts a block index back so another peer can fetch it.
    pub fn return_piece(&self, piece: usize) {
        let _ = self.pieces.0.send(piece);
    }

    /// A receiver that unblocks once the metadata is complete.
    pub fn wait_channel(&self) -> Receiver<()> {
        self.wait_rx.clone()
    }

    /// Closes the completion channel, waking every waiter.
    pub fn close_wait(&mut self) {
        self.wait_tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_message(piece: i64, data: &[u8]) -> ExtensionMessage {
        ExtensionMessage {
            id: 1,
            msg_type: 1,
            piece,
            total_size: 0,
            data: data.to_vec(),
        }
    }

    #[test]
    fn assembles_blocks_in_any_order() {
        let mut metadata = Metadata::new(BLOCK_SIZE + 100);

        metadata.receive(&data_message(1, &vec![2u8; 100]));
        assert!(!metadata.complete());
        assert!(metadata.has_piece(1));

        metadata.receive(&data_message(0, &vec![1u8; BLOCK_SIZE]));
        assert!(metadata.complete());
        assert_eq!(metadata.data()[0], 1);
        assert_eq!(metadata.data()[BLOCK_SIZE], 2);
    }

    #[test]
    fn duplicate_blocks_count_once() {
        let mut metadata = Metadata::new(BLOCK_SIZE + 100);
        metadata.receive(&data_message(1, &vec![2u8; 100]));
        metadata.receive(&data_message(1, &vec![3u8; 100]));
        assert!(!metadata.complete());
    }

    #[test]
    fn block_queue_holds_every_index() {
        let metadata = Metadata::new(3 * BLOCK_SIZE + 1);

        let mut indices = vec![];
        while let Some(piece) = metadata.try_recv_piece() {
            indices.push(piece);
        }
        assert_eq!(indices, vec![0, 1, 2, 3]);

        metadata.return_piece(2);
        assert_eq!(metadata.try_recv_piece(), Some(2));
    }

    #[test]
    fn wait_channel_unblocks_on_close() {
        let mut metadata = Metadata::new(10);
        let wait = metadata.wait_channel();
        assert!(wait.try_recv().is_err());

        metadata.close_wait();
        // a disconnected channel no longer blocks
        assert!(wait.recv().is_err());
    }
}

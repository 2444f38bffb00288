//! # Download Progress
//!
//! Tracks how many bytes have reached the disk, drives the progress bar and
//! logs the completion percent whenever it changes.

use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use crate::piece::Piece;
use crate::torrent::Torrent;

/// Completion accounting for one download.
pub struct Progress {
    start: Instant,
    torrent: Arc<Torrent>,
    downloaded: u64,
    percent: String,
    bar: ProgressBar,
}

impl Progress {
    pub fn new(torrent: Arc<Torrent>) -> Progress {
        let bar = ProgressBar::new(torrent.length());
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        Progress {
            start: Instant::now(),
            torrent,
            downloaded: 0,
            percent: String::new(),
            bar,
        }
    }

    /// Returns true once every byte of the torrent is on disk.
    pub fn complete(&self) -> bool {
        let total = self.torrent.length();
        total > 0 && self.downloaded == total
    }

    /// Accounts one piece that has been written to disk.
    pub fn update(&mut self, piece: &Piece) {
        let total = self.torrent.length();

        // a magnet download learns its total size late
        if self.bar.length() != Some(total) {
            self.bar.set_length(total);
        }

        self.downloaded += piece.length as u64;
        self.bar.inc(piece.length as u64);

        let percent = format!("{:.2}", self.downloaded as f64 / total as f64 * 100.0);
        if percent != self.percent {
            info!("{}% downloaded so far", percent);
        }
        self.percent = percent;
    }

    /// Finishes the bar and logs the elapsed time.
    pub fn done(&self) {
        self.bar.finish();
        info!("Download finished after {:?}", self.start.elapsed());
    }
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
    fn completes_when_every_byte_is_accounted() {
        let torrent = test_torrent();
        let mut progress = Progress::new(Arc::clone(&torrent));
        assert!(!progress.complete());

        progress.update(&Piece::new(0, 32768, 0, vec![]));
        assert!(!progress.complete());

        progress.update(&Piece::new(1, 7232, 32768, vec![]));
        assert!(progress.complete());
    }

    #[test]
    fn incomplete_without_a_known_length() {
        let link = "magnet:?xt=urn:btih:dd02dc8713ca6edfc7dd21d0bf5da58834559a7c\
                    &dn=bilder&tr=udp%3A%2F%2Ftracker.example.org%3A6969";
        let torrent = Arc::new(Torrent::open(link).unwrap());

        let progress = Progress::new(torrent);
        assert!(!progress.complete());
    }
}

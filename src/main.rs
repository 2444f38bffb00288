//! # Tidemark BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol
//! - Magnet link support with metadata retrieval from peers
//! - HTTP(S) and UDP tracker announces
//! - Multi-peer concurrent downloading with piece verification
//! - Single-file and multi-file torrents
//!
//! ## Usage
//!
//! ```bash
//! tidemark <torrent-file>
//! tidemark "magnet:?xt=urn:btih:..."
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: parses arguments, loads the torrent, writes completed
//!   pieces to disk
//! - **Tracker threads**: one announce per tracker
//! - **Worker threads**: one per peer, each driving a full peer connection
//! - **Channels**: bounded queues carry peers, piece work and results

#[macro_use]
extern crate log;

mod bencode;
mod bitfield;
mod client;
mod download;
mod extension;
mod handshake;
mod message;
mod metadata;
mod peer;
mod piece;
mod progress;
mod torrent;
mod tracker;

use anyhow::Result;
use clap::Parser;

use download::Manager;
use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    /// Path to a .torrent file, or a magnet link
    source: String,
}

fn run(args: Args) -> Result<()> {
    let torrent = Torrent::open(&args.source)?;

    info!(
        "Downloading {:?} ({} pieces known)",
        torrent.name(),
        torrent.num_pieces()
    );

    let manager = Manager::new(torrent);
    manager.download();

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}

//! # Download Manager
//!
//! The manager orchestrates a whole download:
//!
//! 1. **Trackers**: every tracker is announced to on its own thread and
//!    pushes the peers it returns onto a shared channel.
//! 2. **Peer collection**: peers are deduplicated by address; each unique
//!    peer is handed to the dispatcher exactly once.
//! 3. **Dispatch**: a worker thread is spawned per peer, bounded by a
//!    connection cap. At the cap the dispatcher blocks until a worker exits.
//! 4. **Writer**: completed pieces arrive on the downloaded channel and are
//!    written to disk until the whole content length is accounted for.
//!
//! Workers fail independently. A dead peer costs nothing but its connection
//! slot; its piece goes back on the queue for someone else.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::client::{self, Client};
use crate::peer::Peer;
use crate::piece::Piece;
use crate::progress::Progress;
use crate::torrent::Torrent;
use crate::tracker::{self, Tracker};

// Upper bound on concurrently connected peers
const CONNECTION_LIMIT: usize = 30;

// Queue capacities between trackers, workers and the writer
const PEERS_CAPACITY: usize = 64;
const DOWNLOADED_CAPACITY: usize = 128;

// Bounded retries around a worker's connect and download phases
const WORKER_RETRIES_MAX: u32 = 5;

/// Coordinates trackers, peer workers and the disk writer for one torrent.
pub struct Manager {
    torrent: Arc<Torrent>,
    progress: Progress,
    downloaded: (Sender<Piece>, Receiver<Piece>),
    done: Arc<AtomicBool>,
}

impl Manager {
    pub fn new(torrent: Torrent) -> Manager {
        let torrent = Arc::new(torrent);

        Manager {
            progress: Progress::new(Arc::clone(&torrent)),
            downloaded: bounded(DOWNLOADED_CAPACITY),
            done: Arc::new(AtomicBool::new(false)),
            torrent,
        }
    }

    /// Runs the download to completion.
    pub fn download(mut self) {
        let (peers_tx, peers_rx) = bounded(PEERS_CAPACITY);
        let pending = Arc::new(Mutex::new(Vec::new()));

        self.announce_to_trackers(peers_tx);
        self.collect_peers(peers_rx, Arc::clone(&pending));
        self.connect_to_peers(pending);

        self.wait();
    }

    /// Spawns one announce per tracker, all at once and only once.
    fn announce_to_trackers(&self, peers: Sender<Peer>) {
        for addr in self.torrent.trackers() {
            let tracker = match tracker::new(&addr, Arc::clone(&self.torrent)) {
                Ok(tracker) => tracker,
                Err(err) => {
                    warn!("{:#}", err);
                    continue;
                }
            };

            let peers = peers.clone();
            thread::spawn(move || announce_to_tracker(tracker, peers));
        }
    }

    /// Collects announced peers, keeping each address only once.
    fn collect_peers(&self, peers: Receiver<Peer>, pending: Arc<Mutex<Vec<Peer>>>) {
        let done = Arc::clone(&self.done);

        thread::spawn(move || {
            let mut seen = HashSet::new();

            loop {
                match peers.recv_timeout(Duration::from_secs(5)) {
                    Ok(peer) => {
                        if seen.insert(peer.to_string()) {
                            pending.lock().unwrap().push(peer);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if done.load(Ordering::Relaxed) {
                            return;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });
    }

    /// Promotes pending peers into workers, bounded by the connection cap.
    fn connect_to_peers(&self, pending: Arc<Mutex<Vec<Peer>>>) {
        let torrent = Arc::clone(&self.torrent);
        let downloaded = self.downloaded.0.clone();
        let done = Arc::clone(&self.done);

        thread::spawn(move || {
            let connections = Arc::new(AtomicUsize::new(0));
            let (conn_wait_tx, conn_wait_rx) = bounded::<()>(0);

            while !done.load(Ordering::Relaxed) {
                let batch: Vec<Peer> = pending.lock().unwrap().drain(..).collect();

                for peer in batch {
                    if done.load(Ordering::Relaxed) {
                        return;
                    }

                    // at the cap, wait for a worker to hand its slot back
                    if connections.load(Ordering::Relaxed) >= CONNECTION_LIMIT {
                        let _ = conn_wait_rx.recv();
                    }

                    connections.fetch_add(1, Ordering::Relaxed);

                    let torrent = Arc::clone(&torrent);
                    let downloaded = downloaded.clone();
                    let connections = Arc::clone(&connections);
                    let conn_wait = conn_wait_tx.clone();

                    thread::spawn(move || {
                        run_worker(peer, torrent, downloaded, connections, conn_wait);
                    });
                }

                thread::sleep(Duration::from_secs(2));
            }
        });
    }

    /// Drains the downloaded channel and writes pieces to disk until the
    /// whole content length has been confirmed on disk.
    fn wait(&mut self) {
        while !self.progress.complete() {
            let piece = match self.downloaded.1.recv() {
                Ok(piece) => piece,
                Err(_) => return,
            };

            match piece.write() {
                Ok(()) => self.progress.update(&piece),
                Err(err) => {
                    // progress only counts bytes that made it to disk, the
                    // piece goes back for another download attempt
                    error!("{:#}", err);
                    let mut piece = piece;
                    piece.reset();
                    self.torrent.return_piece(piece);
                }
            }
        }

        self.done.store(true, Ordering::Relaxed);
        self.progress.done();
    }
}

fn announce_to_tracker(mut tracker: Box<dyn Tracker>, peers: Sender<Peer>) {
    info!("Announcing to tracker '{}'", tracker.endpoint());

    if let Err(err) = tracker.announce() {
        warn!("{:#}", err);
        return;
    }

    for peer in tracker.take_peers() {
        if peers.send(peer).is_err() {
            return;
        }
    }
}

/// Runs one peer connection from dial to disconnect.
///
/// Broken pipes and connection resets get a bounded number of fresh
/// attempts; anything else ends the worker. The connection slot is handed
/// back to the dispatcher on the way out.
fn run_worker(
    peer: Peer,
    torrent: Arc<Torrent>,
    downloaded: Sender<Piece>,
    connections: Arc<AtomicUsize>,
    conn_wait: Sender<()>,
) {
    info!("Connecting to peer '{}'", peer);

    let mut client = Client::new(peer, torrent);

    let mut connected = false;
    for _ in 0..=WORKER_RETRIES_MAX {
        match client.connect() {
            Ok(()) => {
                connected = true;
                break;
            }
            Err(err) if client::is_connection_reset(&err) => continue,
            Err(err) => {
                debug!("client for {} gave up connecting: {:#}", client.peer, err);
                break;
            }
        }
    }

    if connected {
        for _ in 0..=WORKER_RETRIES_MAX {
            match client.download(&downloaded) {
                Ok(()) => break,
                Err(err) if client::is_connection_reset(&err) => continue,
                Err(err) => {
                    debug!("client for {} disconnected: {:#}", client.peer, err);
                    break;
                }
            }
        }
    }

    info!(
        "Disconnecting from peer '{}' in state {:?}",
        client.peer, client.state
    );

    connections.fetch_sub(1, Ordering::Relaxed);
    // only lands if the dispatcher is currently blocked at the cap
    let _ = conn_wait.try_send(());
}

//! The dispatcher's view of one remote peer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::bitfield::SyncBitfield;
use crate::conn::Connection;
use crate::PeerId;

pub struct Peer {
    peer_id: PeerId,
    /// What the remote advertises to hold; grows with piece announcements.
    bitfield: SyncBitfield,
    conn: Arc<Connection>,
    last_good_piece_received: Mutex<Option<Instant>>,
    last_piece_sent: Mutex<Option<Instant>>,
    counters: Counters,
}

impl Peer {
    pub fn new(
        peer_id: PeerId,
        bitfield: SyncBitfield,
        conn: Arc<Connection>,
    ) -> Self {
        Self {
            peer_id,
            bitfield,
            conn,
            last_good_piece_received: Mutex::new(None),
            last_piece_sent: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn bitfield(&self) -> &SyncBitfield {
        &self.bitfield
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn touch_last_good_piece_received(&self, now: Instant) {
        *self.last_good_piece_received.lock().unwrap() = Some(now);
    }

    pub fn last_good_piece_received(&self) -> Option<Instant> {
        *self.last_good_piece_received.lock().unwrap()
    }

    pub fn touch_last_piece_sent(&self, now: Instant) {
        *self.last_piece_sent.lock().unwrap() = Some(now);
    }

    pub fn last_piece_sent(&self) -> Option<Instant> {
        *self.last_piece_sent.lock().unwrap()
    }

    /// A point-in-time copy of the transfer counters.
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            pieces_requested: self.counters.pieces_requested.load(Ordering::Relaxed),
            pieces_received: self.counters.pieces_received.load(Ordering::Relaxed),
            good_pieces: self.counters.good_pieces.load(Ordering::Relaxed),
            duplicate_pieces: self.counters.duplicate_pieces.load(Ordering::Relaxed),
            pieces_sent: self.counters.pieces_sent.load(Ordering::Relaxed),
            requests_sent: self.counters.requests_sent.load(Ordering::Relaxed),
            requests_received: self
                .counters
                .requests_received
                .load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.peer_id[..4]))
    }
}

/// Transfer counters, updated by the feed task and read by observers.
#[derive(Default)]
pub struct Counters {
    /// Pieces we asked this peer for.
    pub pieces_requested: AtomicU64,
    /// Piece payloads that arrived from this peer, good or not.
    pub pieces_received: AtomicU64,
    /// Payloads that verified and were written.
    pub good_pieces: AtomicU64,
    /// Payloads for pieces that were already complete.
    pub duplicate_pieces: AtomicU64,
    /// Payloads we served to this peer.
    pub pieces_sent: AtomicU64,
    /// Piece request messages sent to this peer.
    pub requests_sent: AtomicU64,
    /// Piece request messages received from this peer.
    pub requests_received: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Aggregate per peer statistics, logged at teardown for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    pub pieces_requested: u64,
    pub pieces_received: u64,
    pub good_pieces: u64,
    pub duplicate_pieces: u64,
    pub pieces_sent: u64,
    pub requests_sent: u64,
    pub requests_received: u64,
}

impl fmt::Display for PeerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requested={} received={} good={} duplicate={} sent={} \
             requests_sent={} requests_received={}",
            self.pieces_requested,
            self.pieces_received,
            self.good_pieces,
            self.duplicate_pieces,
            self.pieces_sent,
            self.requests_sent,
            self.requests_received,
        )
    }
}

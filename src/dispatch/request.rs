//! Bookkeeping for outstanding piece requests across peers.
//!
//! The manager enforces the per peer pipeline quota and the
//! one-live-request-per-piece rule (relaxed during endgame), tracks send and
//! validation failures, and surfaces expired requests for the dispatcher's
//! resend pass. All bookkeeping happens under one lock, held only for the
//! duration of an operation, never across I/O.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::conf::DispatchConf;
use crate::{Bitfield, PeerId, PieceIndex};

use super::policy::PolicyKind;

/// The effective status of a request as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Sent; the payload has not arrived yet.
    Pending,
    /// Pending for longer than the timeout.
    Expired,
    /// The send to the peer failed.
    Unsent,
    /// The peer's payload failed validation.
    Invalid,
}

/// A snapshot of one outstanding request.
#[derive(Debug, Clone)]
pub struct PieceRequest {
    pub piece: PieceIndex,
    pub peer_id: PeerId,
    pub status: RequestStatus,
    pub sent_at: Instant,
}

/// What is stored per request; expiry is derived from `sent_at` on read.
#[derive(Debug, Clone, Copy)]
struct StoredRequest {
    status: StoredStatus,
    sent_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoredStatus {
    Pending,
    Unsent,
    Invalid,
}

impl StoredRequest {
    /// A request blocks new reservations only while pending and fresh.
    fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        self.status == StoredStatus::Pending && !self.is_expired(now, timeout)
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.sent_at) > timeout
    }

    fn effective_status(
        &self,
        now: Instant,
        timeout: Duration,
    ) -> RequestStatus {
        match self.status {
            StoredStatus::Unsent => RequestStatus::Unsent,
            StoredStatus::Invalid => RequestStatus::Invalid,
            StoredStatus::Pending => {
                if self.is_expired(now, timeout) {
                    RequestStatus::Expired
                } else {
                    RequestStatus::Pending
                }
            }
        }
    }
}

/// The live request book, indexed both ways.
#[derive(Default)]
struct Book {
    by_peer: HashMap<PeerId, HashMap<PieceIndex, StoredRequest>>,
    by_piece: HashMap<PieceIndex, Vec<PeerId>>,
}

impl Book {
    fn insert(&mut self, peer_id: PeerId, piece: PieceIndex, now: Instant) {
        self.by_peer.entry(peer_id).or_default().insert(
            piece,
            StoredRequest {
                status: StoredStatus::Pending,
                sent_at: now,
            },
        );
        let peers = self.by_piece.entry(piece).or_default();
        if !peers.contains(&peer_id) {
            peers.push(peer_id);
        }
    }

    fn get_mut(
        &mut self,
        peer_id: &PeerId,
        piece: PieceIndex,
    ) -> Option<&mut StoredRequest> {
        self.by_peer.get_mut(peer_id)?.get_mut(&piece)
    }

    /// True iff a new request for `(peer_id, piece)` would not violate the
    /// single live request rules.
    fn is_valid(
        &self,
        peer_id: PeerId,
        piece: PieceIndex,
        allow_duplicates: bool,
        now: Instant,
        timeout: Duration,
    ) -> bool {
        let holders = match self.by_piece.get(&piece) {
            Some(holders) => holders,
            None => return true,
        };
        for holder in holders {
            let req = match self
                .by_peer
                .get(holder)
                .and_then(|reqs| reqs.get(&piece))
            {
                Some(req) => req,
                None => continue,
            };
            if !req.is_live(now, timeout) {
                continue;
            }
            if *holder == peer_id || !allow_duplicates {
                return false;
            }
        }
        true
    }
}

/// The per torrent piece request manager.
pub struct RequestManager {
    book: Mutex<Book>,
    timeout: Duration,
    pipeline_limit: usize,
    policy: PolicyKind,
    clock: Arc<dyn Clock>,
}

/// The request timeout scales with the piece size, with a floor. Computed
/// once per torrent at creation.
pub fn request_timeout(conf: &DispatchConf, max_piece_len: u64) -> Duration {
    let mb = max_piece_len as f64 / (1024.0 * 1024.0);
    std::cmp::max(
        conf.piece_request_min_timeout,
        conf.piece_request_timeout_per_mb.mul_f64(mb),
    )
}

impl RequestManager {
    pub fn new(
        timeout: Duration,
        pipeline_limit: usize,
        policy: PolicyKind,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            timeout,
            pipeline_limit,
            policy,
            clock,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reserves up to the peer's remaining pipeline quota among `candidates`
    /// and marks the picked pieces pending for the peer.
    ///
    /// A piece is a valid pick iff this peer has no live request for it, and,
    /// unless `allow_duplicates` (endgame), no other peer does either.
    /// Expired pending requests don't block new reservations.
    pub fn reserve(
        &self,
        peer_id: PeerId,
        candidates: &Bitfield,
        allow_duplicates: bool,
        num_peers_by_piece: &[AtomicUsize],
    ) -> Vec<PieceIndex> {
        let now = self.clock.now();
        let mut book = self.book.lock().unwrap();

        let live = book
            .by_peer
            .get(&peer_id)
            .map(|reqs| {
                reqs.values()
                    .filter(|req| req.is_live(now, self.timeout))
                    .count()
            })
            .unwrap_or(0);
        let quota = self.pipeline_limit.saturating_sub(live);
        if quota == 0 {
            return Vec::new();
        }

        let picked = self.policy.select(
            quota,
            |piece| {
                book.is_valid(
                    peer_id,
                    piece,
                    allow_duplicates,
                    now,
                    self.timeout,
                )
            },
            candidates,
            num_peers_by_piece,
        );
        for &piece in &picked {
            book.insert(peer_id, piece, now);
        }
        picked
    }

    /// Marks that the request could not be sent to its peer. The record is
    /// kept: it surfaces through `failed_requests` for reassignment.
    pub fn mark_unsent(&self, peer_id: PeerId, piece: PieceIndex) {
        self.mark(peer_id, piece, StoredStatus::Unsent);
    }

    /// Marks that the peer's payload failed validation.
    pub fn mark_invalid(&self, peer_id: PeerId, piece: PieceIndex) {
        self.mark(peer_id, piece, StoredStatus::Invalid);
    }

    fn mark(&self, peer_id: PeerId, piece: PieceIndex, status: StoredStatus) {
        let mut book = self.book.lock().unwrap();
        if let Some(req) = book.get_mut(&peer_id, piece) {
            req.status = status;
        }
    }

    /// All requests whose effective status is unsent, invalid or expired.
    /// The scan does not mutate the book.
    pub fn failed_requests(&self) -> Vec<PieceRequest> {
        let now = self.clock.now();
        let book = self.book.lock().unwrap();
        let mut failed = Vec::new();
        for (peer_id, reqs) in &book.by_peer {
            for (&piece, req) in reqs {
                let status = req.effective_status(now, self.timeout);
                if status != RequestStatus::Pending {
                    failed.push(PieceRequest {
                        piece,
                        peer_id: *peer_id,
                        status,
                        sent_at: req.sent_at,
                    });
                }
            }
        }
        failed
    }

    /// Deletes all records for the piece, across all peers.
    pub fn clear(&self, piece: PieceIndex) {
        let mut book = self.book.lock().unwrap();
        if let Some(holders) = book.by_piece.remove(&piece) {
            for holder in holders {
                if let Some(reqs) = book.by_peer.get_mut(&holder) {
                    reqs.remove(&piece);
                }
            }
        }
    }

    /// Deletes all records for the peer, across all pieces.
    pub fn clear_peer(&self, peer_id: PeerId) {
        let mut book = self.book.lock().unwrap();
        if let Some(reqs) = book.by_peer.remove(&peer_id) {
            for piece in reqs.keys() {
                if let Some(holders) = book.by_piece.get_mut(piece) {
                    holders.retain(|holder| *holder != peer_id);
                }
            }
        }
    }

    /// The pieces this peer has fresh pending requests for, sorted.
    pub fn pending_pieces(&self, peer_id: PeerId) -> Vec<PieceIndex> {
        let now = self.clock.now();
        let book = self.book.lock().unwrap();
        let mut pieces: Vec<_> = book
            .by_peer
            .get(&peer_id)
            .map(|reqs| {
                reqs.iter()
                    .filter(|(_, req)| req.is_live(now, self.timeout))
                    .map(|(&piece, _)| piece)
                    .collect()
            })
            .unwrap_or_default();
        pieces.sort_unstable();
        pieces
    }
}

//! Pluggable piece selection.
//!
//! Both policies receive the reservation quota, a validity predicate, the
//! candidate bitfield and the per piece peer census, and return up to `quota`
//! piece indices.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::{Bitfield, PieceIndex};

/// Which strategy picks the next pieces to reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    /// A uniformly random sample of the valid candidates.
    #[default]
    Default,
    /// Prefer the pieces the fewest peers hold.
    RarestFirst,
}

impl FromStr for PolicyKind {
    type Err = UnknownPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "rarest_first" => Ok(Self::RarestFirst),
            _ => Err(UnknownPolicyError),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown piece request policy")]
pub struct UnknownPolicyError;

impl PolicyKind {
    /// Picks up to `quota` pieces among the set bits of `candidates` that
    /// pass `valid`.
    pub fn select(
        &self,
        quota: usize,
        valid: impl Fn(PieceIndex) -> bool,
        candidates: &Bitfield,
        num_peers_by_piece: &[AtomicUsize],
    ) -> Vec<PieceIndex> {
        if quota == 0 {
            return Vec::new();
        }
        match self {
            Self::Default => select_random(quota, valid, candidates),
            Self::RarestFirst => {
                select_rarest_first(quota, valid, candidates, num_peers_by_piece)
            }
        }
    }
}

/// Reservoir sampling (Algorithm R) over the valid candidates, yielding a
/// uniform sample in one pass.
fn select_random(
    quota: usize,
    valid: impl Fn(PieceIndex) -> bool,
    candidates: &Bitfield,
) -> Vec<PieceIndex> {
    let mut rng = rand::thread_rng();
    let mut reservoir = Vec::with_capacity(quota);
    let mut seen = 0usize;
    for piece in candidates.iter_ones() {
        if !valid(piece) {
            continue;
        }
        seen += 1;
        if reservoir.len() < quota {
            reservoir.push(piece);
        } else {
            let slot = rng.gen_range(0..seen);
            if slot < quota {
                reservoir[slot] = piece;
            }
        }
    }
    reservoir
}

/// Pops the valid candidates off a min-heap keyed by how many peers hold
/// each piece. Ties break towards the lower piece index, stable within a
/// single call.
fn select_rarest_first(
    quota: usize,
    valid: impl Fn(PieceIndex) -> bool,
    candidates: &Bitfield,
    num_peers_by_piece: &[AtomicUsize],
) -> Vec<PieceIndex> {
    let mut heap = BinaryHeap::new();
    for piece in candidates.iter_ones() {
        if !valid(piece) {
            continue;
        }
        let peer_count = num_peers_by_piece
            .get(piece)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0);
        heap.push(Reverse((peer_count, piece)));
    }

    let mut picked = Vec::with_capacity(quota.min(heap.len()));
    while picked.len() < quota {
        match heap.pop() {
            Some(Reverse((_, piece))) => picked.push(piece),
            None => break,
        }
    }
    picked
}

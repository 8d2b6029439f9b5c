use std::sync::{Arc, RwLock};

use crate::{Bitfield, PieceIndex};

/// A mutable, thread-safe projection of which pieces a remote peer holds.
///
/// Updated by piece announcements and completeness notifications while being
/// read concurrently by the request path, so all accessors take `&self`.
/// Clones share the underlying bits.
#[derive(Debug, Clone)]
pub struct SyncBitfield {
    inner: Arc<RwLock<Bitfield>>,
}

impl SyncBitfield {
    pub fn new(bitfield: Bitfield) -> Self {
        Self {
            inner: Arc::new(RwLock::new(bitfield)),
        }
    }

    pub fn repeat(value: bool, len: usize) -> Self {
        Self::new(Bitfield::repeat(value, len))
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the peer holds the piece. Out of bounds indices read as not
    /// held.
    pub fn has(&self, index: PieceIndex) -> bool {
        self.inner
            .read()
            .unwrap()
            .get(index)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    /// Sets one bit and returns its previous value.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn set(&self, index: PieceIndex, value: bool) -> bool {
        let mut bits = self.inner.write().unwrap();
        let prev = *bits.get(index).expect("bitfield index out of bounds");
        bits.set(index, value);
        prev
    }

    pub fn set_all(&self, value: bool) {
        let mut bits = self.inner.write().unwrap();
        bits.fill(value);
    }

    /// Whether every piece is held.
    pub fn complete(&self) -> bool {
        self.inner.read().unwrap().all()
    }

    pub fn count_ones(&self) -> usize {
        self.inner.read().unwrap().count_ones()
    }

    /// A point-in-time copy of the bits.
    pub fn copy(&self) -> Bitfield {
        self.inner.read().unwrap().clone()
    }

    /// The pieces held both here and in `other`.
    pub fn intersection(&self, other: &Bitfield) -> Bitfield {
        let mut out = self.inner.read().unwrap().clone();
        out &= other.as_bitslice();
        out
    }

    /// The indices of all held pieces, in order.
    pub fn set_bits(&self) -> Vec<PieceIndex> {
        self.inner.read().unwrap().iter_ones().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_returns_previous() {
        let bits = SyncBitfield::repeat(false, 4);
        assert!(!bits.set(2, true));
        assert!(bits.set(2, true));
        assert!(bits.has(2));
        assert!(!bits.has(0));
        // out of bounds reads as not held
        assert!(!bits.has(17));
    }

    #[test]
    fn test_complete_and_set_all() {
        let bits = SyncBitfield::repeat(false, 3);
        assert!(!bits.complete());
        bits.set_all(true);
        assert!(bits.complete());
        assert_eq!(bits.set_bits(), vec![0, 1, 2]);
    }

    #[test]
    fn test_intersection() {
        let bits = SyncBitfield::new(Bitfield::repeat(false, 4));
        bits.set(0, true);
        bits.set(3, true);

        let mut other = Bitfield::repeat(false, 4);
        other.set(0, true);
        other.set(1, true);

        let both = bits.intersection(&other);
        assert_eq!(both.iter_ones().collect::<Vec<_>>(), vec![0]);
    }
}
